#![cfg(feature = "test-support")]

#[path = "harness_support.rs"]
mod support;

use device_comm_harness::{ExchangeOutcome, Termination, VerdictPolicy, DEVICE_IDENTITY};
use support::{assert_no_channel_files, config_in, config_with_behavior, run_captured};
use tempfile::tempdir;

#[test]
fn failed_validation_does_not_stop_the_sequence() {
    let dir = tempdir().expect("temp dir");
    let config = config_with_behavior(&dir, "wrong-identity");
    let (report, output) = run_captured(config.clone());

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 4);
    assert!(matches!(
        report.exchanges[0].outcome,
        ExchangeOutcome::Failed(_)
    ));
    assert!(report.exchanges[1..].iter().all(|record| record.passed()));
    assert_eq!(report.reached, None);
    assert_eq!(report.failed_count(), 1);
    assert!(report.device_exit.is_some());

    assert!(output.contains("❌ INITIALIZE test FAILED"));
    assert!(output.contains("✅ FINISH test PASSED"));
    assert!(output.contains("ALL COMMUNICATION TESTS PASSED"));
    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
    assert_no_channel_files(&config);
}

#[test]
fn validation_failures_policy_fails_the_run() {
    let dir = tempdir().expect("temp dir");
    let config = config_with_behavior(&dir, "wrong-identity")
        .with_verdict_policy(VerdictPolicy::ValidationFailures);
    let (report, output) = run_captured(config);

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.failed_count(), 1);
    assert!(!report.succeeded());
    assert!(output.contains("3 of 4 exchanges passed"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn closed_reply_channel_is_recorded_as_failed_exchanges() {
    let dir = tempdir().expect("temp dir");
    let config = config_with_behavior(&dir, "close-output");
    let (report, _) = run_captured(config.clone());

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 4);
    for record in &report.exchanges {
        assert!(record.response.is_empty());
        assert!(
            matches!(&record.outcome, ExchangeOutcome::Failed(reason) if reason.contains("connection closed")),
            "{} -> {:?}",
            record.command,
            record.outcome
        );
    }
    assert_eq!(report.reached, None);
    assert!(report.device_exit.is_some());
    assert_no_channel_files(&config);
}

#[test]
fn non_utf8_response_is_recorded_as_failed_exchange() {
    let dir = tempdir().expect("temp dir");
    let (report, _) = run_captured(config_with_behavior(&dir, "bad-utf8"));

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 4);
    let first = &report.exchanges[0];
    assert!(
        matches!(&first.outcome, ExchangeOutcome::Failed(reason) if reason.contains("UTF-8")),
        "got {:?}",
        first.outcome
    );
    assert!(first.response.contains(DEVICE_IDENTITY));
    assert!(report.exchanges[1..].iter().all(|record| record.passed()));
}

#[test]
fn each_response_is_a_single_read_capped_at_max_len() {
    let dir = tempdir().expect("temp dir");
    let config = config_in(&dir).with_max_response_len(8);
    let (report, _) = run_captured(config);

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 4);
    for record in &report.exchanges {
        assert!(
            record.response.len() <= 8,
            "{} returned {:?}",
            record.command,
            record.response
        );
    }
    assert!(!report.exchanges[0].passed());
}

#[test]
fn fail_fast_stops_after_first_failed_exchange() {
    let dir = tempdir().expect("temp dir");
    let config = config_with_behavior(&dir, "wrong-identity").fail_fast(true);
    let (report, output) = run_captured(config.clone());

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 1);
    assert!(report.device_exit.is_none());
    assert!(!matches!(report.termination, Some(Termination::Killed(_))));
    assert!(output.contains("Stopping sequence after failed exchange"));
    assert_eq!(report.failed_count(), 1);
    assert_no_channel_files(&config);
}
