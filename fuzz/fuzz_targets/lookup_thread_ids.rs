/*
 * fuzz_targets/lookup_thread_ids.rs
 *
 * fuzz target for owner-gated context lookup. after one capture, lookup
 * must return the context for the owning thread id and nothing for any
 * other id - a thread must never be handed another thread's registers.
 */

#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;

use faultgate::{ContextCapture, MACHINE_CONTEXT_SIZE};

static CAPTURE: OnceLock<ContextCapture> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let capture = CAPTURE.get_or_init(|| {
        let c = ContextCapture::new(None);
        let raw = vec![0x5Au8; MACHINE_CONTEXT_SIZE];
        // SAFETY: raw holds MACHINE_CONTEXT_SIZE readable bytes.
        unsafe { c.on_poison_fault(raw.as_ptr().cast()) };
        c
    });

    if data.len() < 8 {
        return;
    }
    let tid = usize::from_le_bytes(data[..8].try_into().unwrap());

    match capture.lookup(tid) {
        Some(ctx) => {
            assert_eq!(Some(tid), capture.owner());
            assert!(ctx.as_bytes().iter().all(|&b| b == 0x5A));
        }
        None => assert_ne!(Some(tid), capture.owner()),
    }
});
