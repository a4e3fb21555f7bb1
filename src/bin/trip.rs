/*
 * trip.rs
 *
 * Deliberately trip one fatal kind and die (or survive, for the modes
 * that return). Exists so the death behaviors - abort on
 * nesting confusion, the interception line format, out-of-memory exit
 * status - can be asserted from outside the process; also handy for
 * eyeballing the reporter by hand:
 *
 *   faultgate-trip assert
 *   FAULTGATE_FATAL_DURING_INIT=1 faultgate-trip selftest
 */

use faultgate::{
    DiagConfig, OomConfig, fatal, guarantee, install, install_fault_handler, not_implemented,
    should_not_call, should_not_reach_here,
};

fn usage() -> u8 {
    eprintln!(
        "usage: faultgate-trip <assert|fatal|status|unreachable|should-not-call|unimplemented|\
         oom|oom-exit|oom-crash|nesting|intercept|selftest|fault>"
    );
    2
}

fn main() {
    std::process::exit(i32::from(run_main()));
}

fn run_main() -> u8 {
    let mode = match std::env::args().nth(1) {
        Some(m) => m,
        None => return usage(),
    };

    let config = match mode.as_str() {
        "oom-exit" => DiagConfig {
            oom: OomConfig {
                exit: true,
                ..OomConfig::default()
            },
            ..DiagConfig::default()
        },
        "oom-crash" => DiagConfig {
            oom: OomConfig {
                crash: true,
                ..OomConfig::default()
            },
            ..DiagConfig::default()
        },
        "intercept" => DiagConfig {
            test_interception: true,
            ..DiagConfig::default()
        },
        _ => DiagConfig::default(),
    };

    /* the selftest mode dies in here when the env hook is set */
    let diag = match install(config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("faultgate-trip: {e}");
            return 1;
        }
    };

    match mode.as_str() {
        "assert" => {
            guarantee!(1 + 1 == 3, "tripped on purpose");
            0 /* unreachable: the reporter aborts */
        }
        "fatal" => {
            fatal!("tripped fatal");
            0
        }
        "status" => {
            faultgate::diag::report_status_error(
                file!(),
                line!(),
                "open",
                libc::ENOENT,
                "missing configuration file",
            );
            0
        }
        "unreachable" => {
            should_not_reach_here!();
            0
        }
        "should-not-call" => {
            should_not_call!();
            0
        }
        "unimplemented" => {
            not_implemented!();
            0
        }
        "oom" => {
            /* no heavy actions configured: message only, then return */
            diag.report_out_of_memory("heap full");
            println!("survived out-of-memory report");
            0
        }
        "oom-exit" => {
            diag.report_out_of_memory("heap full");
            /* _exit(3) already happened */
            1
        }
        "oom-crash" => {
            diag.report_out_of_memory("heap full");
            1
        }
        "nesting" => {
            /* exit with no matching enter: scope torn down twice */
            diag.nesting().exit();
            1
        }
        "intercept" => {
            guarantee!(1 + 1 == 3, "intercepted on purpose");
            println!("survived interception");
            0
        }
        "selftest" => {
            /* install() above already honored the env hook */
            println!("ok");
            0
        }
        "fault" => {
            if let Err(e) = install_fault_handler() {
                eprintln!("faultgate-trip: {e}");
                return 1;
            }
            let addr = diag.poison_address();
            // SAFETY: addr is either the armed poison page - the fault
            // handler makes it readable and the read re-executes - or the
            // harmless fallback byte.
            let byte = unsafe { addr.read_volatile() };
            guarantee!(byte == 0xFF, "context capture trip");
            0
        }
        _ => usage(),
    }
}
