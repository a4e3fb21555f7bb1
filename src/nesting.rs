/*
 * nesting.rs
 *
 * Nesting counter for diagnostic scopes.
 *
 * Every diagnostic command wraps itself in a scope so nested invocations
 * (a diagnostic fired while another diagnostic is running) are
 * distinguishable from top-level ones. The counter must balance: an exit
 * that observes depth 0 means a scope was torn down twice, and the guard
 * protecting the reporting path cannot itself enter the reporting path -
 * it aborts the process directly instead of recursing into the funnel.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::io::write_stderr;

/// Process-wide count of active diagnostic scopes.
///
/// The counter publishes nothing - it is only ever compared against zero -
/// so Relaxed ordering is sufficient on both ends.
pub struct NestingCounter {
    depth: AtomicU32,
}

impl NestingCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    /// Enter a diagnostic scope. Prefer [`NestingCounter::scope`], which
    /// pairs the exit automatically.
    #[inline]
    pub fn enter(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Exit a diagnostic scope.
    ///
    /// An exit with no matching enter is unrecoverable internal confusion
    /// (a scope destroyed twice); it aborts the process immediately.
    #[inline]
    pub fn exit(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            nesting_confusion();
        }
    }

    /// Enter a scope and get an RAII token that exits on drop.
    #[must_use]
    pub fn scope(&self) -> ScopeGuard<'_> {
        self.enter();
        ScopeGuard { counter: self }
    }

    /// Current nesting depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether we are inside at least one diagnostic scope.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }
}

impl Default for NestingCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII token returned by [`NestingCounter::scope`].
pub struct ScopeGuard<'a> {
    counter: &'a NestingCounter,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.counter.exit();
    }
}

/* Unbalanced exit. One raw line, then abort - deliberately not routed
 * through the report funnel, which this counter exists to protect. */
#[cold]
fn nesting_confusion() -> ! {
    write_stderr(b"faultgate: diagnostic scope nesting confusion\n");
    // SAFETY: abort() has no preconditions and never returns.
    unsafe { libc::abort() }
}
