/*
 * Death tests for the fatal funnel, driven through the trip binary.
 *
 * Fatal paths end the process, so they cannot be exercised in-process;
 * each test spawns faultgate-trip in one mode and asserts on the exit
 * status and the diagnostic stream. The line formats checked here are
 * load-bearing: external harnesses grep for them.
 */

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn trip_cmd() -> Command {
    Command::cargo_bin("faultgate-trip").unwrap()
}

/* =========================================================================
 * TERMINATING KINDS - every kind funnels to the reporter, which aborts
 * ========================================================================= */

#[test]
fn test_assert_aborts_with_report() {
    trip_cmd()
        .arg("assert")
        .assert()
        .failure()
        .stderr(predicate::str::contains("A fatal error has been detected"))
        .stderr(predicate::str::contains("assert failed"))
        .stderr(predicate::str::contains("tripped on purpose"))
        .stderr(predicate::str::contains("trip.rs"));
}

#[test]
fn test_fatal_aborts_with_report() {
    trip_cmd()
        .arg("fatal")
        .assert()
        .failure()
        .stderr(predicate::str::contains("fatal error"))
        .stderr(predicate::str::contains("tripped fatal"));
}

#[test]
fn test_status_error_names_errno() {
    trip_cmd()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("status error"))
        .stderr(predicate::str::contains("ENOENT"))
        .stderr(predicate::str::contains("missing configuration file"));
}

#[test]
fn test_unreachable_aborts() {
    trip_cmd()
        .arg("unreachable")
        .assert()
        .failure()
        .stderr(predicate::str::contains("should not reach here"));
}

#[test]
fn test_should_not_call_aborts() {
    trip_cmd()
        .arg("should-not-call")
        .assert()
        .failure()
        .stderr(predicate::str::contains("should not call"));
}

#[test]
fn test_unimplemented_aborts() {
    trip_cmd()
        .arg("unimplemented")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unimplemented"));
}

/* =========================================================================
 * OUT OF MEMORY - message always, heavy actions only as configured
 * ========================================================================= */

#[test]
fn test_oom_without_actions_returns() {
    /* no configured actions: emit the message and give control back */
    trip_cmd()
        .arg("oom")
        .assert()
        .success()
        .stderr(predicate::str::contains("out of memory: heap full"))
        .stdout(predicate::str::contains("survived out-of-memory report"));
}

#[test]
fn test_oom_exit_uses_status_3() {
    /* exit skips cleanup on purpose; monitoring scripts key on status 3 */
    trip_cmd()
        .arg("oom-exit")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("out of memory: heap full"))
        .stderr(predicate::str::contains("terminating due to out-of-memory condition"))
        .stdout(predicate::str::contains("survived").not());
}

#[test]
fn test_oom_crash_escalates_to_fatal_report() {
    trip_cmd()
        .arg("oom-crash")
        .assert()
        .failure()
        .stderr(predicate::str::contains("aborting due to out-of-memory condition"))
        .stderr(predicate::str::contains("out of memory: heap full"));
}

/* =========================================================================
 * INTERNAL CONFUSION - aborts directly, never recurses into the funnel
 * ========================================================================= */

#[test]
fn test_unbalanced_scope_exit_aborts() {
    trip_cmd()
        .arg("nesting")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nesting confusion"))
        /* no fatal report: the guard must not re-enter the reporting path */
        .stderr(predicate::str::contains("A fatal error has been detected").not());
}

/* =========================================================================
 * TEST INTERCEPTION - one recognizable line, then control returns
 * ========================================================================= */

#[test]
fn test_interception_prints_line_and_survives() {
    trip_cmd()
        .arg("intercept")
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "assert failed: 1 + 1 == 3: intercepted on purpose",
        ))
        .stdout(predicate::str::contains("survived interception"));
}

/* =========================================================================
 * INITIALIZATION SELF-TEST - the env hook fires before anything else runs
 * ========================================================================= */

#[test]
fn test_selftest_env_triggers_early_fatal() {
    trip_cmd()
        .arg("selftest")
        .env("FAULTGATE_FATAL_DURING_INIT", "1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("FAULTGATE_FATAL_DURING_INIT"))
        .stdout(predicate::str::contains("ok").not());
}

#[test]
fn test_selftest_env_unset_is_quiet() {
    trip_cmd()
        .arg("selftest")
        .env_remove("FAULTGATE_FATAL_DURING_INIT")
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn test_selftest_env_other_value_is_quiet() {
    trip_cmd()
        .arg("selftest")
        .env("FAULTGATE_FATAL_DURING_INIT", "0")
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

/* =========================================================================
 * FULL CAPTURE PIPELINE - fault, recover, report with register state
 * ========================================================================= */

#[test]
fn test_poison_fault_recovers_and_enriches_report() {
    /*
     * The trip binary touches the poison page: the handler unprotects it,
     * captures the context, the read re-executes, and the subsequent
     * report carries the faulting thread's register state.
     */
    trip_cmd()
        .arg("fault")
        .assert()
        .failure()
        .stderr(predicate::str::contains("context capture trip"))
        .stderr(predicate::str::contains(
            "register state captured for the reporting thread",
        ));
}

/* =========================================================================
 * CLI plumbing
 * ========================================================================= */

#[test]
fn test_unknown_mode_prints_usage() {
    trip_cmd()
        .arg("frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("usage:"));
}

#[test]
fn test_missing_mode_prints_usage() {
    trip_cmd().assert().code(2).stderr(predicate::str::contains("usage:"));
}
