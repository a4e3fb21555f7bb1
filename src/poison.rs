/*
 * poison.rs
 *
 * The poison page: one access-protected page whose only job is to fault.
 *
 * A thread that wants its register state captured touches the poison
 * address. The resulting hardware fault is delivered through the process's
 * normal synchronous-fault path, where probe() recognizes the address,
 * makes the page accessible so the faulting instruction can re-execute,
 * and hands the machine context to the capture slot. No dedicated signal
 * number, no extra API - it composes with whatever crash handling the
 * host process already has.
 *
 * Lifecycle is one-way: Unarmed -> Armed -> Disarmed. A page that fails to
 * arm degrades permanently and the exposed address becomes an ordinary
 * static byte that can never fault - the enrichment feature is simply
 * unavailable, nothing else changes.
 */

use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::error::{DiagError, Result, errno};

/* lifecycle states */
const UNARMED: u8 = 0;
const ARMING: u8 = 1;
const ARMED: u8 = 2;
const DISARMED: u8 = 3;
const DEGRADED: u8 = 4;

/* Harmless fallback byte. Exposed as the poison address whenever no real
 * page is armed; accessing it can never fault. */
static POISON_FALLBACK: u8 = 0;

/// Guard owning the process's poison page.
///
/// All fields are atomics: probe() runs inside a fault handler and must
/// not lock. Created once, armed once, never unmapped - the page outlives
/// every reader, and a munmap would race the fault dispatcher.
pub struct PoisonPageGuard {
    state: AtomicU8,
    page: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl PoisonPageGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNARMED),
            page: AtomicPtr::new(core::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Reserve and commit one page, then protect it inaccessible.
    ///
    /// On any step failure the guard degrades permanently: the poison
    /// address stays the harmless fallback byte and [`probe`] refuses
    /// every address. The error is returned so the caller can log it;
    /// context enrichment is simply unavailable from then on.
    ///
    /// A second call after a successful arm is rejected - one poison page
    /// per process, and once disarmed it is never re-armed (the process is
    /// assumed to be terminating).
    ///
    /// [`probe`]: PoisonPageGuard::probe
    pub fn arm(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(UNARMED, ARMING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DiagError::AlreadyArmed);
        }

        let len = page_size();

        // SAFETY: mmap with null hint, anonymous private mapping, no fd.
        // Reserves and commits one fresh page readable/writable.
        let page = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            let err = DiagError::PageMap(errno());
            self.state.store(DEGRADED, Ordering::Release);
            return Err(err);
        }

        // SAFETY: page is a valid mapping of len bytes we just created.
        if unsafe { libc::mprotect(page, len, libc::PROT_NONE) } != 0 {
            let err = DiagError::PageProtect(errno());
            // SAFETY: page/len describe the mapping created above; nothing
            // else has seen the address yet.
            unsafe {
                libc::munmap(page, len);
            }
            self.state.store(DEGRADED, Ordering::Release);
            return Err(err);
        }

        /* publish the page before the Armed state so a probe that observes
         * Armed (Acquire) also observes the address */
        self.page.store(page.cast(), Ordering::Release);
        self.len.store(len, Ordering::Release);
        self.state.store(ARMED, Ordering::Release);
        Ok(())
    }

    /// The address runtime code should touch to request context capture.
    ///
    /// While armed this is the protected page; otherwise it is the
    /// harmless fallback byte, so callers never need to branch on whether
    /// the feature is available.
    #[must_use]
    pub fn poison_address(&self) -> *const u8 {
        let page = self.page.load(Ordering::Acquire);
        if page.is_null() {
            &POISON_FALLBACK
        } else {
            page
        }
    }

    /// Fault-dispatcher entry: is this fault ours, and if so, defuse it.
    ///
    /// Returns `false` for any address that is not the armed poison page -
    /// not our fault to handle, propagate to default crash handling. On a
    /// match, the page is made accessible so the faulting instruction can
    /// safely re-execute; if that protection change fails (possible under
    /// memory pressure) the fault is left unhandled, with no retry.
    ///
    /// A probe at the poison address after disarming still reports `true`:
    /// the page is already accessible and nothing needs doing.
    pub fn probe(&self, fault_addr: *const u8) -> bool {
        match self.state.load(Ordering::Acquire) {
            ARMED => {
                let page = self.page.load(Ordering::Acquire);
                if page.is_null() || !core::ptr::eq(fault_addr, page) {
                    return false;
                }
                if !self.unprotect() {
                    return false;
                }
                /* plain store: a racing probe that also saw Armed has done
                 * the same idempotent unprotect */
                self.state.store(DISARMED, Ordering::Release);
                true
            }
            DISARMED => core::ptr::eq(fault_addr, self.page.load(Ordering::Acquire)),
            /* Unarmed, arming, degraded: nothing is ours */
            _ => false,
        }
    }

    /// Retire the poison page ahead of termination reporting.
    ///
    /// Makes the page accessible and transitions to Disarmed so stray
    /// touches during error reporting cannot fault again. If the page
    /// cannot be unprotected the guard degrades and later faults at the
    /// address fall through to default crash handling.
    pub fn disarm(&self) {
        if self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && !self.unprotect()
        {
            self.state.store(DEGRADED, Ordering::Release);
        }
    }

    /// Whether the page is currently armed (will fault when touched).
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    /* Make the page fully accessible again. Failing is surprising but
     * real: mprotect can fail under memory pressure. */
    fn unprotect(&self) -> bool {
        let page = self.page.load(Ordering::Acquire);
        let len = self.len.load(Ordering::Acquire);
        if page.is_null() || len == 0 {
            return false;
        }
        // SAFETY: page/len describe the mapping created in arm(), which is
        // never unmapped for the life of the process.
        if unsafe { libc::mprotect(page.cast(), len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            #[cfg(debug_assertions)]
            crate::io::write_stderr(b"faultgate: poison page cannot be unprotected\n");
            return false;
        }
        true
    }

    /* Test hook for the forced-arm-failure scenario. */
    #[cfg(test)]
    fn degrade_for_test(&self) {
        self.state.store(DEGRADED, Ordering::Release);
    }
}

impl Default for PoisonPageGuard {
    fn default() -> Self {
        Self::new()
    }
}

/* One page, from the platform. */
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}
