/*
 * process.rs
 *
 * Runs the configured out-of-memory command ("sh -c <cmd>").
 *
 * posix_spawn rather than fork+exec: it can use vfork internally and
 * avoids copying page tables, which matters when the process spawning it
 * is the one that just ran out of memory. The argv is prepared (and
 * allocated) once at install time, so the spawn itself allocates nothing.
 */

use core::ffi::c_char;
use core::ptr;
use std::ffi::CString;

use crate::error::{DiagError, Result, errno};

unsafe extern "C" {
    /* environ is a global variable pointing to the environment */
    static environ: *const *mut c_char;
}

/// Exit information for a finished command - std::process::ExitStatus
/// without std::process.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatus {
    raw: i32,
}

impl CommandStatus {
    /// Exit code, if the command exited normally.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.raw) {
            Some(libc::WEXITSTATUS(self.raw))
        } else {
            None
        }
    }

    /// Terminating signal, if the command was killed by one.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.raw) {
            Some(libc::WTERMSIG(self.raw))
        } else {
            None
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

/// A shell command with its argv prepared ahead of time.
///
/// Built during installation, while allocating is still safe; running it
/// later builds only a stack array of pointers.
pub struct PreparedCommand {
    /* "sh", "-c", <command> */
    argv: [CString; 3],
}

impl PreparedCommand {
    /// Prepare `sh -c <command>`.
    pub fn shell(command: &str) -> Result<Self> {
        let sh = CString::new("sh").map_err(|_| DiagError::InvalidCommand)?;
        let dash_c = CString::new("-c").map_err(|_| DiagError::InvalidCommand)?;
        let cmd = CString::new(command).map_err(|_| DiagError::InvalidCommand)?;
        Ok(Self {
            argv: [sh, dash_c, cmd],
        })
    }

    /// The command text, for diagnostic lines.
    #[must_use]
    pub fn command_text(&self) -> &str {
        /* built from &str in shell(), so this cannot fail */
        self.argv[2].to_str().unwrap_or("")
    }

    /// Spawn the command and wait for it to finish.
    ///
    /// The child inherits stdio and the environment. Errors are returned,
    /// never escalated: a failing out-of-memory command must not block the
    /// remaining termination actions.
    pub fn run(&self) -> Result<CommandStatus> {
        let argv_ptrs: [*mut c_char; 4] = [
            self.argv[0].as_ptr().cast_mut(),
            self.argv[1].as_ptr().cast_mut(),
            self.argv[2].as_ptr().cast_mut(),
            ptr::null_mut(),
        ];

        let mut pid: libc::pid_t = 0;
        // SAFETY: argv_ptrs is a null-terminated array of valid C strings
        // that outlive the call; null attributes and file actions request
        // defaults; environ is the process environment. posix_spawnp
        // returns an errno value directly rather than setting errno.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let rc = unsafe {
            libc::posix_spawnp(
                &raw mut pid,
                self.argv[0].as_ptr(),
                ptr::null(),
                ptr::null(),
                argv_ptrs.as_ptr(),
                environ,
            )
        };
        if rc != 0 {
            return Err(DiagError::Spawn(rc));
        }

        /* reap, retrying on EINTR */
        let mut status: i32 = 0;
        loop {
            // SAFETY: pid is the child just spawned; status is a valid out
            // pointer.
            let r = unsafe { libc::waitpid(pid, &raw mut status, 0) };
            if r == pid {
                return Ok(CommandStatus { raw: status });
            }
            if r < 0 && errno() == libc::EINTR {
                continue;
            }
            return Err(DiagError::Wait(errno()));
        }
    }
}
