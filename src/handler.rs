/*
 * handler.rs
 *
 * Glue between the platform's synchronous-fault delivery and the
 * diagnostics object.
 *
 * Hosts with their own crash-handler chain call Diagnostics::probe from
 * that chain instead. This module is for processes without one: it
 * registers a SIGSEGV/SIGBUS handler (SIGBUS because some platforms
 * deliver protection faults as bus errors) that consults probe() and,
 * when the fault is not ours, restores the default disposition and
 * returns - the faulting instruction re-executes and the default action
 * takes over, so ordinary crashes still crash normally.
 *
 * Everything inside the trampoline is async-signal-safe: an address
 * compare, one mprotect, one byte copy, atomics.
 */

use core::ffi::c_void;

use crate::error::{DiagError, Result, errno};

/* faults that a PROT_NONE access can surface as */
const FAULT_SIGNALS: [i32; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// Register the poison-fault trampoline for SIGSEGV and SIGBUS.
///
/// Call after [`crate::diag::install`]. A fault arriving before
/// installation is treated as not-ours and crashes through the default
/// path.
pub fn install_fault_handler() -> Result<()> {
    for sig in FAULT_SIGNALS {
        // SAFETY: sigaction struct is zeroed then properly initialized.
        // fault_trampoline is an extern "C" fn with the SA_SIGINFO
        // signature. sigemptyset and sigaction are standard POSIX calls
        // with valid arguments. All ops share the invariant of setting up
        // one handler atomically.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let rc = unsafe {
            let mut sa: libc::sigaction = core::mem::zeroed();
            sa.sa_sigaction = fault_trampoline as *const () as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&raw mut sa.sa_mask);
            libc::sigaction(sig, &sa, core::ptr::null_mut())
        };
        if rc != 0 {
            return Err(DiagError::HandlerInstall(errno()));
        }
    }
    Ok(())
}

/* The handler proper. Runs on the faulting thread's stack, asynchronously
 * with respect to normal control flow; must not block, allocate, or lock. */
extern "C" fn fault_trampoline(sig: i32, info: *mut libc::siginfo_t, uctx: *mut c_void) {
    if !info.is_null()
        && let Some(diag) = crate::diag::installed()
    {
        // SAFETY: info was delivered by the kernel for this signal; the
        // accessor just reads the faulting address out of it.
        let addr = unsafe { fault_address(info) };
        // SAFETY: uctx is the ucontext the kernel passed alongside the
        // signal - exactly MACHINE_CONTEXT_SIZE readable bytes (or null
        // on exotic deliveries, which probe tolerates).
        if unsafe { diag.probe(addr, uctx) } {
            /* handled: the page is accessible now, let the instruction
             * re-execute */
            return;
        }
    }

    /* Not ours. Restore the default disposition and return; the fault
     * re-fires immediately and the default action (core dump) runs. */
    // SAFETY: SIG_DFL is the standard default handler; sigaction with a
    // zeroed struct plus SIG_DFL is valid from a signal handler.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&raw mut sa.sa_mask);
        libc::sigaction(sig, &sa, core::ptr::null_mut());
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *const libc::siginfo_t) -> *const u8 {
    // SAFETY: caller passes the siginfo delivered for a SIGSEGV/SIGBUS,
    // where si_addr carries the faulting address.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        (*info).si_addr() as *const u8
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> *const u8 {
    // SAFETY: caller passes the siginfo delivered for a SIGSEGV/SIGBUS,
    // where si_addr carries the faulting address.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        (*info).si_addr as *const u8
    }
}

/* End-to-end coverage (install, touch the poison address, recover, report
 * with context) lives in the trip binary and tests/funnel.rs: a handler
 * installed in-process would leak into every other test in this binary. */
