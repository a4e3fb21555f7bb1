/*
 * fuzz_targets/probe_addresses.rs
 *
 * fuzz target for poison-page probing. probe must refuse every address
 * that is not the poison page - a false positive here would swallow a
 * real crash.
 *
 * edge cases: null, the fallback byte, page-adjacent addresses, the
 * poison address itself (disarms, then stays handled).
 */

#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;

use faultgate::PoisonPageGuard;

static GUARD: OnceLock<PoisonPageGuard> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let guard = GUARD.get_or_init(|| {
        let g = PoisonPageGuard::new();
        let _ = g.arm();
        g
    });

    if data.len() < 8 {
        return;
    }
    let addr = usize::from_le_bytes(data[..8].try_into().unwrap()) as *const u8;

    let handled = guard.probe(addr);
    /* the only address probe may ever handle is the poison page itself */
    if handled {
        assert!(core::ptr::eq(addr, guard.poison_address()));
    }
});
