#![cfg(feature = "test-support")]

#[path = "harness_support.rs"]
mod support;

use device_comm_harness::{
    DeviceId, LogStream, SequenceState, Termination, FINISHED_MARKER, PARAMS_SET_MARKER,
};
use support::{assert_no_channel_files, config_in, run_captured};
use tempfile::tempdir;

#[test]
fn drives_dummy_device_end_to_end() {
    let dir = tempdir().expect("temp dir");
    let config = config_in(&dir);
    let (report, output) = run_captured(config.clone());

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.exchanges.len(), 4);
    assert!(report.exchanges.iter().all(|record| record.passed()));
    assert_eq!(report.reached, Some(SequenceState::Finished));
    assert_eq!(report.exit_code(), 0);

    let commands: Vec<_> = report
        .exchanges
        .iter()
        .map(|record| record.command.split(':').next().unwrap_or_default())
        .collect();
    assert_eq!(
        commands,
        ["INITIALIZE", "GETPARAMETERS", "SETPARAMETERS", "FINISH"]
    );
    assert!(report.exchanges[2].response.contains(PARAMS_SET_MARKER));
    assert!(report.exchanges[3].response.contains(FINISHED_MARKER));

    let status = report.device_exit.expect("device should exit after FINISH");
    assert!(status.success());
    assert!(matches!(
        report.termination,
        Some(Termination::AlreadyExited(_))
    ));

    assert!(output.contains("✅ INITIALIZE test PASSED"));
    assert!(output.contains("[Cleanup]"));
    assert!(output.contains("✅ ALL COMMUNICATION TESTS PASSED!"));
    assert!(report.cleanup.is_clean());
    assert_no_channel_files(&config);
}

#[test]
fn device_receives_configured_parameters() {
    let dir = tempdir().expect("temp dir");
    let (report, _) = run_captured(config_in(&dir));

    let received = report
        .device_logs
        .iter()
        .filter(|line| line.stream == LogStream::Stdout)
        .find(|line| line.line.starts_with("received SETPARAMETERS:"))
        .expect("device should log the SETPARAMETERS line");
    assert!(received.line.contains("\"dataPoints\":5"));
    assert!(received.line.contains("\"measurementType\":\"temperature\""));
}

#[test]
fn repeated_runs_with_same_device_id_succeed() {
    let dir = tempdir().expect("temp dir");
    let config = config_in(&dir).with_device_id(DeviceId::new("repeat_device"));

    for attempt in 0..2 {
        let (report, _) = run_captured(config.clone());
        assert_eq!(report.exit_code(), 0, "attempt {attempt} failed: {report:?}");
        assert_no_channel_files(&config);
    }
}
