/*
 * io.rs
 *
 * Signal-safe diagnostic output.
 * Direct writes to stderr via write(2) - the only output primitive that is
 * legal inside a fault handler. No buffering, no locking, no allocation;
 * each write is one syscall, which is fine for output that is one line at
 * a time and happens once, right before the process dies.
 */

use core::fmt::{self, Write};

/* stderr file descriptor */
const STDERR: i32 = 2;

/// A sink for immediate diagnostic output.
///
/// Plain function pointer so the diagnostics object stays `Copy`-friendly
/// and the call is legal from a fault handler. The default writes straight
/// to stderr; tests install a collecting sink instead.
pub type Sink = fn(&[u8]);

/// The default sink: raw write to stderr.
pub fn stderr_sink(bytes: &[u8]) {
    write_stderr(bytes);
}

/// Write bytes to stderr. Best-effort: a failed or short write is ignored,
/// there is nowhere left to report it.
#[inline]
pub fn write_stderr(s: &[u8]) {
    // SAFETY: s is a valid byte slice, STDERR is always valid
    unsafe {
        libc::write(STDERR, s.as_ptr().cast(), s.len());
    }
}

/// A writer that outputs to stderr via direct syscall.
/// Implements core::fmt::Write for use with write!/writeln! macros.
pub struct StderrWriter;

impl Write for StderrWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_stderr(s.as_bytes());
        Ok(())
    }
}

/// A writer that formats into an arbitrary [`Sink`].
///
/// Formatting through `core::fmt` does not allocate; each formatted
/// fragment is handed to the sink as it is produced.
pub struct SinkWriter {
    sink: Sink,
}

impl SinkWriter {
    #[must_use]
    pub fn new(sink: Sink) -> Self {
        Self { sink }
    }
}

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.sink)(s.as_bytes());
        Ok(())
    }
}
