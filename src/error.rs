/*
 * error.rs
 *
 * Errors for the fallible setup operations (arming the poison page,
 * installing the fault handler, spawning the out-of-memory command).
 *
 * The fatal paths themselves never return errors - a fatal condition is
 * reported and the process dies. These are only for the cold setup calls,
 * where the caller decides whether degradation is acceptable.
 */

use core::fmt;

/// Exit status used when out-of-memory termination is configured to exit
/// rather than abort. Skips destructors on purpose: the process is already
/// out of memory and must not re-enter allocation paths. Monitoring
/// scripts key on this value.
pub mod exit_codes {
    /// Immediate process exit on an out-of-memory condition.
    pub const OUT_OF_MEMORY: u8 = 3;
}

/* everything that can go wrong during setup */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagError {
    /// The process-wide diagnostics object was already installed.
    AlreadyInstalled,
    /// The poison page was already armed (one page per process).
    AlreadyArmed,
    /// mmap of the poison page failed (errno).
    PageMap(i32),
    /// mprotect of the poison page failed (errno).
    PageProtect(i32),
    /// sigaction registration failed (errno).
    HandlerInstall(i32),
    /// The configured out-of-memory command contains an interior NUL.
    InvalidCommand,
    /// posix_spawn of the out-of-memory command failed (errno).
    Spawn(i32),
    /// waitpid on the out-of-memory command failed (errno).
    Wait(i32),
}

impl fmt::Display for DiagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "diagnostics already installed"),
            Self::AlreadyArmed => write!(f, "poison page already armed"),
            Self::PageMap(errno) => {
                write!(f, "failed to map poison page: {} ({errno})", errno_name(*errno))
            }
            Self::PageProtect(errno) => {
                write!(f, "failed to protect poison page: {} ({errno})", errno_name(*errno))
            }
            Self::HandlerInstall(errno) => {
                write!(f, "failed to install fault handler: {} ({errno})", errno_name(*errno))
            }
            Self::InvalidCommand => write!(f, "out-of-memory command contains NUL"),
            Self::Spawn(errno) => {
                write!(f, "failed to spawn out-of-memory command: {} ({errno})", errno_name(*errno))
            }
            Self::Wait(errno) => {
                write!(f, "failed to wait for out-of-memory command: {} ({errno})", errno_name(*errno))
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, DiagError>;

/// Name for an errno value, for diagnostic lines. Total: unknown values
/// get a generic name rather than an error (this runs on reporting paths).
#[must_use]
pub const fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::ESRCH => "ESRCH",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::ENOSPC => "ENOSPC",
        libc::EPIPE => "EPIPE",
        libc::EAGAIN => "EAGAIN",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENOSYS => "ENOSYS",
        libc::ELOOP => "ELOOP",
        libc::ETIMEDOUT => "ETIMEDOUT",
        _ => "errno",
    }
}

/* Get errno for the current thread */
#[cfg(target_os = "linux")]
#[inline]
pub(crate) fn errno() -> i32 {
    // SAFETY: __errno_location always returns a valid thread-local pointer
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__errno_location()
    }
}

/* Get errno - on macOS this is a thread-local via __error() */
#[cfg(target_os = "macos")]
#[inline]
pub(crate) fn errno() -> i32 {
    // SAFETY: __error always returns a valid thread-local pointer on macOS
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_errno_name() {
        let err = DiagError::PageProtect(libc::ENOMEM);
        let msg = format!("{err}");
        assert!(msg.contains("ENOMEM"), "message should name the errno: {msg}");
    }

    #[test]
    fn test_errno_name_known_and_unknown() {
        assert_eq!(errno_name(libc::EINVAL), "EINVAL");
        assert_eq!(errno_name(-12345), "errno");
    }

    #[test]
    fn test_errno_reflects_failed_call() {
        // SAFETY: close(-1) is harmless and guaranteed to fail with EBADF
        let rc = unsafe { libc::close(-1) };
        assert_eq!(rc, -1);
        assert_eq!(errno(), libc::EBADF);
    }
}
