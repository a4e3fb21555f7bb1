/*
 * sync.rs
 *
 * Lock-free synchronization primitives for the fatal paths.
 *
 * Nothing in this crate may block, allocate, or take a mutex: the trigger
 * path runs inside a synchronous hardware-fault handler, which may have
 * interrupted a thread that already holds arbitrary locks. The only
 * synchronization device permitted on a hot path is a single atomic
 * compare-and-set, wrapped here as FireLatch. AtomicOnce exists for the
 * cold path only (installing the process-wide diagnostics object once at
 * startup).
 */

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A gate that can be claimed exactly once, by exactly one caller.
///
/// `claim()` is a single compare-and-set: among any number of concurrent
/// callers precisely one receives `true`, all others `false`. There is no
/// blocking, no allocation, and no reset - once fired, fired forever.
///
/// Safe to call from a signal/fault handler.
///
/// # Memory ordering
///
/// The successful CAS uses `AcqRel`: everything the winner wrote before
/// claiming is visible to any loser that subsequently observes the fired
/// state with `Acquire`. Callers that publish data *after* winning must
/// provide their own Release edge for that data (see `ContextCapture`,
/// which publishes the owner id with a Release store after the copy).
pub struct FireLatch {
    fired: AtomicBool,
}

impl FireLatch {
    /// Create an unclaimed latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Attempt to claim the latch. Returns `true` for exactly one caller
    /// over the lifetime of the latch.
    #[inline]
    pub fn claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether some caller has already claimed the latch.
    #[inline]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Default for FireLatch {
    fn default() -> Self {
        Self::new()
    }
}

/* state machine for one-time initialization */
const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// A cell that can be written to only once, thread-safe.
///
/// Similar to `std::sync::OnceLock`, but the value lives in static storage
/// and the implementation is a plain atomic state machine - no poisoning,
/// no waiter queue, nothing that could surprise a fault handler reading it.
/// Holds the process-wide diagnostics singleton, which is created during
/// runtime initialization and then only ever read.
///
/// # Safety Invariants
///
/// The state machine guarantees safe access:
/// - `UNINIT`: value is None, safe to write (after winning CAS)
/// - `INITIALIZING`: one thread is writing, readers see None
/// - `INITIALIZED`: value is Some, immutable, safe to read
///
/// Memory ordering:
/// - Writers use `Release` when storing `INITIALIZED` to publish the value
/// - Readers use `Acquire` when loading state to see the published value
/// - CAS uses `AcqRel` for both synchronization directions
pub struct AtomicOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: AtomicOnce is Sync because:
// 1. The state field uses atomic operations with proper ordering
// 2. The UnsafeCell is only written when state transitions UNINIT -> INITIALIZING
//    (protected by compare_exchange, only one thread can win)
// 3. The UnsafeCell is only read when state == INITIALIZED, after the writer
//    has stored with Release ordering and reader loads with Acquire
// 4. Once INITIALIZED, the value is immutable (no &mut T is ever returned)
unsafe impl<T: Send + Sync> Sync for AtomicOnce<T> {}

// SAFETY: AtomicOnce is Send because T: Send. The AtomicU8 is inherently Send,
// and the UnsafeCell<Option<T>> is Send when T: Send.
unsafe impl<T: Send> Send for AtomicOnce<T> {}

impl<T> AtomicOnce<T> {
    /// Create a new uninitialized cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(None),
        }
    }

    /// Get the value if initialized.
    ///
    /// Returns None while another thread is mid-initialization; the fault
    /// dispatcher treats that the same as "not installed" rather than
    /// spinning (spinning inside a fault handler is not an option).
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            // SAFETY: state is INITIALIZED with Acquire ordering, which synchronizes
            // with the Release store in set(). The value was written before that
            // Release store, so we can safely read it. The value is immutable
            // once INITIALIZED (we never hand out &mut T).
            unsafe { (*self.value.get()).as_ref() }
        } else {
            None
        }
    }

    /// Set the value if not already set. Returns Err if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        /* try to claim the initialization slot */
        match self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: We won the CAS race, transitioning UNINIT -> INITIALIZING.
                // No other thread can be reading (state wasn't INITIALIZED) or
                // writing (we hold the INITIALIZING slot). Safe to write.
                unsafe {
                    *self.value.get() = Some(value);
                }
                // Release ordering ensures the write above is visible to any
                // thread that subsequently loads INITIALIZED with Acquire.
                self.state.store(INITIALIZED, Ordering::Release);
                Ok(())
            }
            Err(_) => {
                /* already initializing or initialized */
                Err(value)
            }
        }
    }
}

impl<T> Default for AtomicOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}


/* -------------------------------------------------------------------------- */
/*                              kani proofs                                   */
/* -------------------------------------------------------------------------- */

#[cfg(kani)]
mod kani_proofs {
    use super::*;

    /*
     * verify the single-fire contract: the first claim succeeds, every
     * claim after a success fails, and fired() reflects the transition.
     */
    #[kani::proof]
    fn verify_latch_single_fire() {
        let latch = FireLatch::new();
        kani::assert(!latch.fired(), "new latch must be unfired");

        let first = latch.claim();
        kani::assert(first, "first claim must win");
        kani::assert(latch.fired(), "latch must report fired after a win");

        let second = latch.claim();
        kani::assert(!second, "second claim must lose");
    }

    /*
     * verify the once-cell state machine only moves forward:
     * UNINIT -> INITIALIZING -> INITIALIZED, never backwards.
     */
    #[kani::proof]
    fn verify_once_state_machine_monotonic() {
        let mut state: u8 = UNINIT;

        if state == UNINIT {
            state = INITIALIZING;
        }
        kani::assert(state == INITIALIZING, "should transition to INITIALIZING");

        if state == INITIALIZING {
            state = INITIALIZED;
        }
        kani::assert(state == INITIALIZED, "should transition to INITIALIZED");

        kani::assert(state >= UNINIT, "state never goes below UNINIT");
        kani::assert(state <= INITIALIZED, "state never exceeds INITIALIZED");
    }
}
