// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bin_tests::test_runner::{
    run_crash_test, validate_report, CrashTestConfig, CrashTestOutcome, CHAINED_MARKER_FILE,
    SECOND_REPORT_FILE, SURVIVED_MARKER_FILE,
};
use bin_tests::test_types::{CrashType, TestMode};
use bin_tests::BuildProfile;
use crashcatch::CRASHCATCH_BEGIN_REPORT;

fn run(mode: TestMode, crash_type: CrashType) -> CrashTestOutcome {
    run_crash_test(&CrashTestConfig::new(BuildProfile::Debug, mode, crash_type)).unwrap()
}

fn assert_captured(outcome: &CrashTestOutcome, crash_type: CrashType) {
    assert_eq!(
        outcome.termination_signal(),
        Some(crash_type.signal()),
        "stderr: {}",
        outcome.stderr
    );
    let report = outcome.report().unwrap();
    validate_report(&report, crash_type).unwrap();
    assert_eq!(outcome.raw_report.matches(CRASHCATCH_BEGIN_REPORT).count(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_trigger_fault() {
    let outcome = run(TestMode::Default, CrashType::TriggerFault);
    assert_captured(&outcome, CrashType::TriggerFault);
    assert!(
        outcome.stderr.contains("Crash handlers installed"),
        "stderr: {}",
        outcome.stderr
    );

    let report = outcome.report().unwrap();
    let sig_info = report.sig_info.unwrap();
    assert_eq!(sig_info.si_addr.as_deref(), Some("0x0000000000000000"));
    assert!(report.ucontext.is_some());
    #[cfg(target_os = "linux")]
    {
        assert_eq!(report.thread_name.as_deref(), Some("crashcatch_bin_"));
        assert!(report.files.contains_key("/proc/self/maps"));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_raised_signals() {
    for crash_type in [
        CrashType::RaiseSigAbrt,
        CrashType::RaiseSigBus,
        CrashType::RaiseSigFpe,
        CrashType::RaiseSigIll,
        CrashType::RaiseSigSegv,
    ] {
        let outcome = run(TestMode::Default, crash_type);
        assert_captured(&outcome, crash_type);
        // Raised by the process itself.
        let report = outcome.report().unwrap();
        let pid = report.proc_info.as_ref().map(|p| p.pid as i32);
        assert_eq!(report.sig_info.and_then(|s| s.si_pid), pid);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stack_overflow() {
    let outcome = run(TestMode::Default, CrashType::StackOverflow);
    assert_captured(&outcome, CrashType::StackOverflow);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_chains_to_previous_handler() {
    for crash_type in [CrashType::TriggerFault, CrashType::RaiseSigAbrt] {
        let outcome = run(TestMode::Prechain, crash_type);
        assert_captured(&outcome, crash_type);
        assert!(outcome.fixture_exists(CHAINED_MARKER_FILE), "{crash_type}");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_fault_in_previous_handler_is_not_reported_twice() {
    let outcome = run(TestMode::PrechainReentrant, CrashType::TriggerFault);
    assert_captured(&outcome, CrashType::TriggerFault);
    assert!(outcome.fixture_exists(CHAINED_MARKER_FILE));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_resethand_previous_handler_terminates() {
    for crash_type in [CrashType::TriggerFault, CrashType::RaiseSigAbrt] {
        let outcome = run(TestMode::PrechainResetHand, crash_type);
        assert_captured(&outcome, crash_type);
        assert!(outcome.fixture_exists(CHAINED_MARKER_FILE), "{crash_type}");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_second_install_is_ignored() {
    let outcome = run(TestMode::DoubleInstall, CrashType::TriggerFault);
    assert_captured(&outcome, CrashType::TriggerFault);
    assert!(!outcome.fixture_exists(SECOND_REPORT_FILE));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_without_alt_stack() {
    let outcome = run(TestMode::NoAltStack, CrashType::RaiseSigSegv);
    assert_captured(&outcome, CrashType::RaiseSigSegv);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_disabled_keeps_termination() {
    let outcome = run(TestMode::Disabled, CrashType::TriggerFault);
    assert_eq!(outcome.termination_signal(), Some(libc::SIGSEGV));
    assert_eq!(outcome.raw_report, "");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_ffi_entry_points() {
    let outcome = run(TestMode::Ffi, CrashType::TriggerFault);
    assert_captured(&outcome, CrashType::TriggerFault);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_ignored_user_signal_is_not_a_crash() {
    let outcome = run(TestMode::IgnoredUserSignal, CrashType::RaiseSigAbrt);
    assert!(outcome.exit_status.success(), "stderr: {}", outcome.stderr);
    assert!(outcome.fixture_exists(SURVIVED_MARKER_FILE));
    assert_eq!(outcome.raw_report, "");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_fault_after_ignored_user_signal_is_reported() {
    let outcome = run(TestMode::IgnoredThenFault, CrashType::TriggerFault);
    assert_captured(&outcome, CrashType::TriggerFault);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_sigpipe_while_writing_report() {
    let outcome = run(TestMode::BrokenSink, CrashType::TriggerFault);
    assert_eq!(
        outcome.termination_signal(),
        Some(libc::SIGSEGV),
        "stderr: {}",
        outcome.stderr
    );
    assert_eq!(outcome.raw_report, "");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_unwinder_stacktrace_from_env() {
    let outcome = run_crash_test(
        &CrashTestConfig::new(BuildProfile::Debug, TestMode::Default, CrashType::TriggerFault)
            .with_env(crashcatch::ENV_STACKTRACE, "unwinder"),
    )
    .unwrap();
    assert_eq!(outcome.termination_signal(), Some(libc::SIGSEGV));
    let report = outcome.report().unwrap();
    assert!(report.complete);
    let stacktrace = report.stacktrace.unwrap();
    assert!(!stacktrace.incomplete);
    assert!(!stacktrace.frames.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stacktrace_disabled_from_env() {
    let outcome = run_crash_test(
        &CrashTestConfig::new(BuildProfile::Debug, TestMode::Default, CrashType::RaiseSigIll)
            .with_env(crashcatch::ENV_STACKTRACE, "none")
            .with_env(crashcatch::ENV_MEMORY_MAPS, "false"),
    )
    .unwrap();
    assert_eq!(outcome.termination_signal(), Some(libc::SIGILL));
    let report = outcome.report().unwrap();
    assert!(report.complete);
    assert!(report.files.is_empty());
    assert!(report
        .stacktrace
        .as_ref()
        .map_or(true, |s| s.frames.is_empty()));
}

#[test]
#[ignore] // This test is slow, only run it if explicitly opted in
fn test_trigger_fault_release() {
    let outcome = run_crash_test(&CrashTestConfig::new(
        BuildProfile::Release,
        TestMode::Default,
        CrashType::TriggerFault,
    ))
    .unwrap();
    assert_captured(&outcome, CrashType::TriggerFault);
}
