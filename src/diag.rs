/*
 * diag.rs
 *
 * The process-scoped diagnostics object and the fatal report funnel.
 *
 * One explicit object owns everything the fatal paths touch - the poison
 * page, the captured context, both single-fire latches, the sink and the
 * reporter - instead of a scatter of free globals. It is installed once
 * during runtime initialization into statically allocated storage and
 * referenced by the fault dispatcher and every report entry point. All
 * access stays lock-free; installation is the only cold transition.
 *
 * Every fatal kind converges here: normalize, attach the captured context
 * when the calling thread owns it, hand off to the reporter. The reporter
 * never returns - except in test interception mode, where the funnel
 * prints one recognizable line and gives control back to the harness.
 */

use core::ffi::c_void;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::context::{ContextCapture, ContextFixup, current_thread_id, platform_fixup};
use crate::error::{DiagError, Result, errno_name, exit_codes};
use crate::io::{Sink, SinkWriter, StderrWriter, stderr_sink, write_stderr};
use crate::nesting::{NestingCounter, ScopeGuard};
use crate::poison::PoisonPageGuard;
use crate::process::PreparedCommand;
use crate::report::{ErrorKind, ErrorReport, FatalCategory, Reporter, abort_reporter};
use crate::sync::{AtomicOnce, FireLatch};

/// Environment variable checked during installation. When set to `1`, a
/// fatal error fires immediately - validates that the reporting path works
/// before the host runtime is otherwise up.
pub const FATAL_DURING_INIT_ENV: &str = "FAULTGATE_FATAL_DURING_INIT";

/// What to do - beyond emitting the message - when out-of-memory is
/// reported. Each action is gated independently; the winner of the OOM
/// latch runs the enabled ones in declaration order.
#[derive(Default)]
pub struct OomConfig {
    /// Heap-dump collaborator hook, run first (before the command can
    /// disturb the heap).
    pub heap_dump: Option<fn()>,
    /// Shell command to run (`sh -c <command>`), e.g. a notifier.
    pub command: Option<String>,
    /// Escalate to a fatal report (abort with a full report).
    pub crash: bool,
    /// Exit immediately with status 3, skipping destructors so nothing
    /// re-enters allocation paths.
    pub exit: bool,
}

/// Installation-time configuration for [`Diagnostics`].
pub struct DiagConfig {
    pub oom: OomConfig,
    /// Diagnostic output sink. Defaults to raw stderr writes.
    pub sink: Sink,
    /// The format-and-terminate collaborator. Defaults to the built-in
    /// minimal reporter.
    pub reporter: Reporter,
    /// Post-copy context fix-up. Defaults to the build target's.
    pub fixup: Option<ContextFixup>,
    /// Arm the poison page during installation.
    pub arm_poison: bool,
    /// Start in test interception mode (see
    /// [`Diagnostics::set_test_interception`]).
    pub test_interception: bool,
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            oom: OomConfig::default(),
            sink: stderr_sink,
            reporter: abort_reporter,
            fixup: platform_fixup(),
            arm_poison: true,
            test_interception: false,
        }
    }
}

/// The process-scoped diagnostics object.
pub struct Diagnostics {
    poison: PoisonPageGuard,
    capture: ContextCapture,
    nesting: NestingCounter,
    oom_latch: FireLatch,
    oom_heap_dump: Option<fn()>,
    oom_command: Option<PreparedCommand>,
    oom_crash: bool,
    oom_exit: bool,
    sink: Sink,
    reporter: Reporter,
    test_interception: AtomicBool,
}

impl Diagnostics {
    /// Build an unarmed instance from configuration. Fails only on an
    /// unusable out-of-memory command (interior NUL).
    pub fn new(config: DiagConfig) -> Result<Self> {
        let oom_command = match config.oom.command {
            Some(cmd) => Some(PreparedCommand::shell(&cmd)?),
            None => None,
        };
        Ok(Self {
            poison: PoisonPageGuard::new(),
            capture: ContextCapture::new(config.fixup),
            nesting: NestingCounter::new(),
            oom_latch: FireLatch::new(),
            oom_heap_dump: config.oom.heap_dump,
            oom_command,
            oom_crash: config.oom.crash,
            oom_exit: config.oom.exit,
            sink: config.sink,
            reporter: config.reporter,
            test_interception: AtomicBool::new(config.test_interception),
        })
    }

    /// The poison page guard.
    #[must_use]
    pub fn poison(&self) -> &PoisonPageGuard {
        &self.poison
    }

    /// The context capture slot.
    #[must_use]
    pub fn capture(&self) -> &ContextCapture {
        &self.capture
    }

    /// The diagnostic-scope nesting counter.
    #[must_use]
    pub fn nesting(&self) -> &NestingCounter {
        &self.nesting
    }

    /// Enter a diagnostic scope (RAII).
    #[must_use]
    pub fn scope(&self) -> ScopeGuard<'_> {
        self.nesting.scope()
    }

    /// Address runtime code touches to request context capture.
    #[must_use]
    pub fn poison_address(&self) -> *const u8 {
        self.poison.poison_address()
    }

    /// Fault-dispatcher entry point.
    ///
    /// Returns `false` when the fault is not ours (propagate to default
    /// crash handling). On a poison-page fault: disarm the page, capture
    /// the context exactly once, and return `true` - the faulting
    /// instruction may safely re-execute.
    ///
    /// # Safety
    ///
    /// `raw_context` must be null or point to at least
    /// [`crate::context::MACHINE_CONTEXT_SIZE`] readable bytes (the
    /// `ucontext` delivered to a signal handler qualifies).
    pub unsafe fn probe(&self, fault_addr: *const u8, raw_context: *const c_void) -> bool {
        if !self.poison.probe(fault_addr) {
            return false;
        }
        // SAFETY: caller upholds the raw_context contract.
        unsafe { self.capture.on_poison_fault(raw_context) };
        true
    }

    /// Toggle test interception. While on, fatal reports print one
    /// recognizable line to the sink and return instead of terminating.
    pub fn set_test_interception(&self, on: bool) {
        self.test_interception.store(on, Ordering::Release);
    }

    /// Emit a non-fatal warning line through the sink.
    pub fn warning(&self, args: fmt::Arguments<'_>) {
        let mut w = SinkWriter::new(self.sink);
        let _ = writeln!(w, "warning: {args}");
    }

    /// Report a failed assertion.
    pub fn report_assertion(&self, file: &str, line: u32, message: &str, detail: fmt::Arguments<'_>) {
        self.dispatch(ErrorKind::Assertion, file, line, message, detail);
    }

    /// Report a typed fatal error.
    pub fn report_fatal(
        &self,
        category: FatalCategory,
        file: &str,
        line: u32,
        detail: fmt::Arguments<'_>,
    ) {
        self.dispatch(ErrorKind::Fatal(category), file, line, "", detail);
    }

    /// Report an OS-level failure with its errno.
    pub fn report_status_error(&self, file: &str, line: u32, message: &str, status: i32, detail: &str) {
        self.dispatch(
            ErrorKind::StatusError(status),
            file,
            line,
            message,
            format_args!("error {} ({}), {}", errno_name(status), status, detail),
        );
    }

    /// Report entry into unimplemented functionality.
    pub fn report_unimplemented(&self, file: &str, line: u32) {
        self.dispatch(ErrorKind::Unimplemented, file, line, "", format_args!(""));
    }

    /// Report execution of a must-be-unreachable path.
    pub fn report_should_not_reach_here(&self, file: &str, line: u32) {
        self.dispatch(ErrorKind::ShouldNotReachHere, file, line, "", format_args!(""));
    }

    /// Report a call into a must-not-be-called function.
    pub fn report_should_not_call(&self, file: &str, line: u32) {
        self.dispatch(ErrorKind::ShouldNotCall, file, line, "", format_args!(""));
    }

    /// Report an out-of-memory condition.
    ///
    /// The message is emitted for every caller - many threads tend to hit
    /// the wall together, and deduping the message would hide that. The
    /// heavy actions run at most once process-wide, in fixed order, with
    /// no step's failure blocking the next.
    pub fn report_out_of_memory(&self, message: &str) {
        {
            let mut w = SinkWriter::new(self.sink);
            let _ = writeln!(w, "out of memory: {message}");
        }

        /* losers return here: the message is out, the winner owns the rest */
        if !self.oom_latch.claim() {
            return;
        }

        if let Some(dump) = self.oom_heap_dump {
            let mut w = SinkWriter::new(self.sink);
            let _ = writeln!(w, "dumping heap before out-of-memory termination");
            dump();
        }

        if let Some(cmd) = &self.oom_command {
            {
                let mut w = SinkWriter::new(self.sink);
                let _ = writeln!(w, "running out-of-memory command: {}", cmd.command_text());
            }
            match cmd.run() {
                Ok(status) if !status.success() => {
                    if let Some(sig) = status.signal() {
                        self.warning(format_args!("out-of-memory command killed by signal {sig}"));
                    } else {
                        self.warning(format_args!(
                            "out-of-memory command exited with code {}",
                            status.code().unwrap_or(-1)
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => self.warning(format_args!("{e}")),
            }
        }

        if self.oom_crash {
            {
                let mut w = SinkWriter::new(self.sink);
                let _ = writeln!(w, "aborting due to out-of-memory condition");
            }
            self.report_fatal(
                FatalCategory::OutOfMemoryHeap,
                file!(),
                line!(),
                format_args!("out of memory: {message}"),
            );
        }

        if self.oom_exit {
            {
                let mut w = SinkWriter::new(self.sink);
                let _ = writeln!(w, "terminating due to out-of-memory condition");
            }
            // SAFETY: _exit terminates immediately without running atexit
            // handlers or destructors - deliberately, to avoid re-entering
            // allocation paths while out of memory.
            unsafe { libc::_exit(i32::from(exit_codes::OUT_OF_MEMORY)) }
        }
    }

    /* The one normalized path every kind funnels through. */
    fn dispatch(&self, kind: ErrorKind, file: &str, line: u32, message: &str, detail: fmt::Arguments<'_>) {
        if self.test_interception.load(Ordering::Acquire) {
            self.print_for_test(kind, message, detail);
            return;
        }

        let report = ErrorReport {
            kind,
            file,
            line,
            message,
            detail,
            context: self.capture.lookup(current_thread_id()),
        };
        (self.reporter)(&report);

        /* the reporter broke its contract - terminate without it */
        write_stderr(b"faultgate: fatal reporter returned; aborting\n");
        // SAFETY: abort() has no preconditions and never returns.
        unsafe { libc::abort() }
    }

    /* One short line in a stable format, for death-test harnesses that
     * grep a stream instead of parsing a full report. */
    fn print_for_test(&self, kind: ErrorKind, message: &str, detail: fmt::Arguments<'_>) {
        let mut w = SinkWriter::new(self.sink);
        let prefix = match kind {
            ErrorKind::Assertion => "assert failed",
            _ => "fatal error",
        };
        if message.is_empty() {
            let _ = writeln!(w, "{prefix}: {detail}");
        } else if detail.as_str() == Some("") {
            let _ = writeln!(w, "{prefix}: {message}");
        } else {
            let _ = writeln!(w, "{prefix}: {message}: {detail}");
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                     process-wide installation and entry                    */
/* -------------------------------------------------------------------------- */

/* Statically allocated: the capture slot inside must be writable from a
 * fault handler without touching the heap. */
static DIAGNOSTICS: AtomicOnce<Diagnostics> = AtomicOnce::new();

/// Install the process-wide diagnostics object. Call once during runtime
/// initialization, before registering the fault handler.
///
/// Arms the poison page (unless disabled); arming failure degrades to
/// "context enrichment unavailable" with a warning, it is not fatal.
/// Honors the [`FATAL_DURING_INIT_ENV`] self-test hook.
pub fn install(config: DiagConfig) -> Result<&'static Diagnostics> {
    let arm_poison = config.arm_poison;
    let diag = Diagnostics::new(config)?;
    if DIAGNOSTICS.set(diag).is_err() {
        return Err(DiagError::AlreadyInstalled);
    }
    let Some(diag) = DIAGNOSTICS.get() else {
        /* set() just succeeded on this thread */
        return Err(DiagError::AlreadyInstalled);
    };

    if arm_poison && let Err(e) = diag.poison.arm() {
        diag.warning(format_args!("context capture unavailable: {e}"));
    }

    /* self-test: prove the reporting path works this early */
    if std::env::var_os(FATAL_DURING_INIT_ENV).is_some_and(|v| v == "1") {
        diag.report_fatal(
            FatalCategory::Internal,
            file!(),
            line!(),
            format_args!("{FATAL_DURING_INIT_ENV}"),
        );
    }

    Ok(diag)
}

/// The installed diagnostics object, if any.
#[must_use]
pub fn installed() -> Option<&'static Diagnostics> {
    DIAGNOSTICS.get()
}

/* Free entry points used by the macros. Reporting must work even before
 * installation: with no diagnostics object there is no context to attach
 * and nothing configured, so fall back to a raw line and abort. */

pub fn report_assertion(file: &str, line: u32, message: &str, detail: fmt::Arguments<'_>) {
    match installed() {
        Some(d) => d.report_assertion(file, line, message, detail),
        None => fallback_fatal("assert failed", file, line, message, detail),
    }
}

pub fn report_fatal(category: FatalCategory, file: &str, line: u32, detail: fmt::Arguments<'_>) {
    match installed() {
        Some(d) => d.report_fatal(category, file, line, detail),
        None => fallback_fatal("fatal error", file, line, "", detail),
    }
}

pub fn report_status_error(file: &str, line: u32, message: &str, status: i32, detail: &str) {
    match installed() {
        Some(d) => d.report_status_error(file, line, message, status, detail),
        None => fallback_fatal(
            "status error",
            file,
            line,
            message,
            format_args!("error {} ({}), {}", errno_name(status), status, detail),
        ),
    }
}

pub fn report_unimplemented(file: &str, line: u32) {
    match installed() {
        Some(d) => d.report_unimplemented(file, line),
        None => fallback_fatal("unimplemented", file, line, "", format_args!("")),
    }
}

pub fn report_should_not_reach_here(file: &str, line: u32) {
    match installed() {
        Some(d) => d.report_should_not_reach_here(file, line),
        None => fallback_fatal("should not reach here", file, line, "", format_args!("")),
    }
}

pub fn report_should_not_call(file: &str, line: u32) {
    match installed() {
        Some(d) => d.report_should_not_call(file, line),
        None => fallback_fatal("should not call", file, line, "", format_args!("")),
    }
}

pub fn report_out_of_memory(message: &str) {
    match installed() {
        Some(d) => d.report_out_of_memory(message),
        None => {
            /* message still goes out; no actions are configured */
            let mut w = StderrWriter;
            let _ = writeln!(w, "out of memory: {message}");
        }
    }
}

#[cold]
fn fallback_fatal(prefix: &str, file: &str, line: u32, message: &str, detail: fmt::Arguments<'_>) -> ! {
    let mut w = StderrWriter;
    if message.is_empty() {
        let _ = writeln!(w, "{prefix}: {detail}");
    } else {
        let _ = writeln!(w, "{prefix}: {message}: {detail}");
    }
    let _ = writeln!(w, "  at {file}:{line}");
    // SAFETY: abort() has no preconditions and never returns.
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<String> = Mutex::new(String::new());

    fn capturing_sink(bytes: &[u8]) {
        CAPTURED
            .lock()
            .unwrap()
            .push_str(core::str::from_utf8(bytes).unwrap());
    }

    fn drain_captured() -> String {
        let mut guard = CAPTURED.lock().unwrap();
        core::mem::take(&mut *guard)
    }

    fn intercepting(config_oom: OomConfig) -> Diagnostics {
        Diagnostics::new(DiagConfig {
            oom: config_oom,
            sink: capturing_sink,
            test_interception: true,
            arm_poison: false,
            ..DiagConfig::default()
        })
        .unwrap()
    }

    /* The capturing sink is shared between tests in this module; a lock
     * around each scenario keeps their output separated. */
    static SCENARIO: Mutex<()> = Mutex::new(());

    #[test]
    fn test_interception_prints_one_line_and_returns() {
        let _serial = SCENARIO.lock().unwrap();
        let diag = intercepting(OomConfig::default());
        drain_captured();

        diag.report_assertion("x.rs", 10, "ptr != null", format_args!("got {}", 0));
        let out = drain_captured();
        assert_eq!(out, "assert failed: ptr != null: got 0\n");

        diag.report_fatal(FatalCategory::Internal, "y.rs", 20, format_args!("boom"));
        assert_eq!(drain_captured(), "fatal error: boom\n");
    }

    #[test]
    fn test_status_error_line_names_errno() {
        let _serial = SCENARIO.lock().unwrap();
        let diag = intercepting(OomConfig::default());
        drain_captured();

        diag.report_status_error("z.rs", 5, "mmap", libc::ENOMEM, "reserving arena");
        let out = drain_captured();
        assert!(out.starts_with("fatal error: mmap: error ENOMEM"), "{out}");
        assert!(out.contains("reserving arena"), "{out}");
    }

    #[test]
    fn test_oom_message_per_call_actions_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DUMPS: AtomicUsize = AtomicUsize::new(0);
        fn dump() {
            DUMPS.fetch_add(1, Ordering::Relaxed);
        }

        let _serial = SCENARIO.lock().unwrap();
        let diag = intercepting(OomConfig {
            heap_dump: Some(dump),
            ..OomConfig::default()
        });
        drain_captured();
        DUMPS.store(0, Ordering::Relaxed);

        diag.report_out_of_memory("heap full");
        diag.report_out_of_memory("heap full");
        diag.report_out_of_memory("heap full");

        let out = drain_captured();
        assert_eq!(out.matches("out of memory: heap full").count(), 3);
        assert_eq!(out.matches("dumping heap").count(), 1);
        assert_eq!(DUMPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_oom_command_runs_once() {
        let _serial = SCENARIO.lock().unwrap();
        let marker = std::env::temp_dir().join("faultgate_oom_cmd_test");
        let _ = std::fs::remove_file(&marker);

        let diag = intercepting(OomConfig {
            command: Some(format!("echo ran >> {}", marker.display())),
            ..OomConfig::default()
        });
        drain_captured();

        diag.report_out_of_memory("native arena exhausted");
        diag.report_out_of_memory("native arena exhausted");

        let body = std::fs::read_to_string(&marker).expect("command should have run");
        assert_eq!(body.matches("ran").count(), 1);
        let _ = std::fs::remove_file(&marker);

        let out = drain_captured();
        assert_eq!(out.matches("running out-of-memory command").count(), 1);
    }

    #[test]
    fn test_oom_crash_escalates_through_funnel() {
        let _serial = SCENARIO.lock().unwrap();
        /* interception catches the escalated fatal, so this stays alive */
        let diag = intercepting(OomConfig {
            crash: true,
            ..OomConfig::default()
        });
        drain_captured();

        diag.report_out_of_memory("heap full");
        let out = drain_captured();
        assert!(out.contains("aborting due to out-of-memory condition"), "{out}");
        assert!(out.contains("fatal error: out of memory: heap full"), "{out}");
    }

    #[test]
    fn test_failed_command_does_not_block_following_steps() {
        let _serial = SCENARIO.lock().unwrap();
        let diag = intercepting(OomConfig {
            command: Some("exit 9".to_string()),
            crash: true,
            ..OomConfig::default()
        });
        drain_captured();

        diag.report_out_of_memory("heap full");
        let out = drain_captured();
        assert!(out.contains("warning: out-of-memory command exited with code 9"), "{out}");
        /* the crash step still ran */
        assert!(out.contains("aborting due to out-of-memory condition"), "{out}");
    }

    #[test]
    fn test_degraded_arm_still_reports_without_context() {
        let _serial = SCENARIO.lock().unwrap();
        /* arm_poison=false: enrichment unavailable, reporting must work */
        let diag = intercepting(OomConfig::default());
        drain_captured();

        assert!(!diag.poison().is_armed());
        let addr = diag.poison_address();
        // SAFETY: no page armed, so probe only compares addresses.
        assert!(!unsafe { diag.probe(addr, core::ptr::null()) });

        diag.report_assertion("a.rs", 1, "cond", format_args!(""));
        assert_eq!(drain_captured(), "assert failed: cond\n");
    }

    #[test]
    fn test_warning_goes_through_sink() {
        let _serial = SCENARIO.lock().unwrap();
        let diag = intercepting(OomConfig::default());
        drain_captured();
        diag.warning(format_args!("poke {}", 3));
        assert_eq!(drain_captured(), "warning: poke 3\n");
    }
}
