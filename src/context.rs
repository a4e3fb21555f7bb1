/*
 * context.rs
 *
 * Race-free capture of the faulting thread's machine context.
 *
 * The fault dispatcher hands us an opaque, platform-defined register
 * snapshot (a ucontext_t). Whichever thread wins the capture latch copies
 * it into static storage exactly once and becomes the recorded owner;
 * every other thread's capture attempt is a no-op. Reports later attach
 * the context only for the owning thread - a thread must never present
 * another thread's register state as its own.
 *
 * Storage is statically allocated: this code runs inside a fault handler,
 * where allocating is off the table.
 */

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::FireLatch;

/// Size of the platform machine-context snapshot.
pub const MACHINE_CONTEXT_SIZE: usize = core::mem::size_of::<libc::ucontext_t>();

/// Opaque copy of a thread's register/execution state at fault time.
///
/// Kept as raw bytes: nothing in this crate interprets the contents, it is
/// forwarded to the fatal reporter for rendering. Aligned generously so a
/// platform fix-up may view it as the real `ucontext_t`.
#[repr(C, align(16))]
pub struct MachineContext {
    bytes: [u8; MACHINE_CONTEXT_SIZE],
}

impl MachineContext {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            bytes: [0; MACHINE_CONTEXT_SIZE],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Post-copy repair pass for machine-context representations that embed
/// pointers into their own structure. Copying such a context verbatim
/// leaves those pointers aimed at the original (dead) storage; the fix-up
/// rewrites them to point into the copy.
///
/// Which platforms need this is configuration, not a hardcoded list -
/// [`platform_fixup`] supplies the default for the build target and the
/// hook can be overridden at install time.
pub type ContextFixup = fn(&mut MachineContext);

/// The fix-up required by the current build target, if any.
#[must_use]
pub fn platform_fixup() -> Option<ContextFixup> {
    #[cfg(all(target_os = "linux", target_arch = "powerpc64"))]
    {
        Some(fixup_linux_ppc64)
    }
    #[cfg(not(all(target_os = "linux", target_arch = "powerpc64")))]
    {
        None
    }
}

/* On linux/ppc64 the ucontext embeds a pointer into itself
 * (uc_mcontext.regs aims at uc_mcontext.gp_regs, see sys/ucontext.h);
 * after a byte copy it must be re-aimed at the copy. */
#[cfg(all(target_os = "linux", target_arch = "powerpc64"))]
fn fixup_linux_ppc64(ctx: &mut MachineContext) {
    // SAFETY: bytes hold a complete ucontext_t copied from the kernel and
    // the storage is aligned for it.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        let uc = ctx.bytes.as_mut_ptr().cast::<libc::ucontext_t>();
        (*uc).uc_mcontext.regs = core::ptr::addr_of_mut!((*uc).uc_mcontext.gp_regs).cast();
    }
}

/// Identifier of the calling thread, readable from a fault handler.
///
/// 0 is reserved as the "no owner" sentinel; the kernel never hands out a
/// zero thread id.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_thread_id() -> usize {
    // SAFETY: gettid has no preconditions and is async-signal-safe.
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions; it reads thread-local
    // state and is safe from a signal handler in practice.
    unsafe { libc::pthread_self() as usize }
}

/// Write-once slot for the captured context plus its owning thread.
pub struct ContextCapture {
    latch: FireLatch,
    owner: AtomicUsize,
    slot: UnsafeCell<MachineContext>,
    fixup: Option<ContextFixup>,
}

// SAFETY: the slot is written exactly once, by the single thread that wins
// the capture latch, and the owner id is published afterwards with Release
// ordering. Readers go through lookup(), which loads the owner with
// Acquire before touching the slot; once the owner is nonzero the slot is
// immutable. No &mut to the slot is ever handed out.
unsafe impl Sync for ContextCapture {}
// SAFETY: all fields are plain data; nothing is tied to a thread.
unsafe impl Send for ContextCapture {}

impl ContextCapture {
    #[must_use]
    pub const fn new(fixup: Option<ContextFixup>) -> Self {
        Self {
            latch: FireLatch::new(),
            owner: AtomicUsize::new(0),
            slot: UnsafeCell::new(MachineContext::zeroed()),
            fixup,
        }
    }

    /// Capture the supplied raw machine context for the calling thread.
    ///
    /// Claims the capture latch; the winner copies the context bytes, runs
    /// the platform fix-up, and publishes itself as owner. Losers (and a
    /// null context) are a no-op - the context already recorded stands.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to at least [`MACHINE_CONTEXT_SIZE`]
    /// readable bytes holding a machine context (the `ucontext` the kernel
    /// passed to the fault handler qualifies).
    pub unsafe fn on_poison_fault(&self, raw: *const c_void) {
        if raw.is_null() {
            return;
        }
        if !self.latch.claim() {
            return;
        }
        // SAFETY: we won the latch, so we are the only writer ever; the
        // caller guarantees raw points to MACHINE_CONTEXT_SIZE readable
        // bytes; the slot is not yet visible to readers (owner still 0).
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        unsafe {
            let dst = (*self.slot.get()).bytes.as_mut_ptr();
            core::ptr::copy_nonoverlapping(raw.cast::<u8>(), dst, MACHINE_CONTEXT_SIZE);
            if let Some(fixup) = self.fixup {
                fixup(&mut *self.slot.get());
            }
        }
        /* Release publishes the copied bytes together with the owner id */
        self.owner.store(current_thread_id(), Ordering::Release);
    }

    /// The captured context, if `thread_id` is the recorded owner.
    #[must_use]
    pub fn lookup(&self, thread_id: usize) -> Option<&MachineContext> {
        let owner = self.owner.load(Ordering::Acquire);
        if owner == 0 || owner != thread_id {
            return None;
        }
        // SAFETY: owner is nonzero, so the winner's copy completed before
        // the Release store we just observed with Acquire; the slot is
        // immutable from here on.
        Some(unsafe { &*self.slot.get() })
    }

    /// Thread id of the capture owner, if any thread has captured yet.
    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_context(fill: u8) -> Vec<u8> {
        vec![fill; MACHINE_CONTEXT_SIZE]
    }

    #[test]
    fn test_lookup_empty_before_capture() {
        let capture = ContextCapture::new(None);
        assert_eq!(capture.owner(), None);
        assert!(capture.lookup(current_thread_id()).is_none());
    }

    #[test]
    fn test_capture_records_calling_thread() {
        let capture = ContextCapture::new(None);
        let raw = fake_context(0xAB);
        // SAFETY: raw holds MACHINE_CONTEXT_SIZE readable bytes.
        unsafe { capture.on_poison_fault(raw.as_ptr().cast()) };

        let me = current_thread_id();
        assert_eq!(capture.owner(), Some(me));
        let ctx = capture.lookup(me).expect("owner must see the context");
        assert!(ctx.as_bytes().iter().all(|&b| b == 0xAB));
        /* any other thread id sees nothing */
        assert!(capture.lookup(me.wrapping_add(1)).is_none());
        assert!(capture.lookup(0).is_none());
    }

    #[test]
    fn test_second_capture_is_noop() {
        let capture = ContextCapture::new(None);
        let first = fake_context(0x11);
        let second = fake_context(0x22);
        // SAFETY: both buffers hold MACHINE_CONTEXT_SIZE readable bytes.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        unsafe {
            capture.on_poison_fault(first.as_ptr().cast());
            capture.on_poison_fault(second.as_ptr().cast());
        }
        let ctx = capture
            .lookup(current_thread_id())
            .expect("owner must see the context");
        assert!(ctx.as_bytes().iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_null_context_does_not_claim() {
        let capture = ContextCapture::new(None);
        // SAFETY: null is explicitly allowed and ignored.
        unsafe { capture.on_poison_fault(core::ptr::null()) };
        assert_eq!(capture.owner(), None);

        /* a real context can still be captured afterwards */
        let raw = fake_context(0x5C);
        // SAFETY: raw holds MACHINE_CONTEXT_SIZE readable bytes.
        unsafe { capture.on_poison_fault(raw.as_ptr().cast()) };
        assert_eq!(capture.owner(), Some(current_thread_id()));
    }

    #[test]
    fn test_fixup_runs_on_the_copy() {
        fn stamp(ctx: &mut MachineContext) {
            ctx.bytes[0] = 0xEE;
        }
        let capture = ContextCapture::new(Some(stamp));
        let raw = fake_context(0x00);
        // SAFETY: raw holds MACHINE_CONTEXT_SIZE readable bytes.
        unsafe { capture.on_poison_fault(raw.as_ptr().cast()) };
        let ctx = capture
            .lookup(current_thread_id())
            .expect("owner must see the context");
        assert_eq!(ctx.as_bytes()[0], 0xEE);
        /* source buffer untouched - the fix-up works on the copy */
        assert_eq!(raw[0], 0x00);
    }

    #[test]
    fn test_thread_ids_are_nonzero_and_distinct() {
        let main_tid = current_thread_id();
        assert_ne!(main_tid, 0);
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(other, 0);
        assert_ne!(main_tid, other);
    }
}
