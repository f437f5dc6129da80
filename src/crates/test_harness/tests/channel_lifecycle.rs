use std::fs;
use std::os::unix::net::UnixStream;
use std::path::Path;

use device_comm_harness::{cleanup, ChannelPair, ChannelPaths, DeviceId, HarnessError};
use tempfile::tempdir;

fn paths_in(dir: &Path, id: &str) -> ChannelPaths {
    ChannelPaths::derive(dir, "CoreFxPipe_", &DeviceId::new(id))
}

#[test]
fn provision_then_cleanup_leaves_no_artifacts() {
    let dir = tempdir().expect("temp dir");
    let paths = paths_in(dir.path(), "lifecycle");

    let pair = ChannelPair::provision(paths.clone()).expect("channels should bind");
    assert!(paths.server_to_client.exists());
    assert!(paths.client_to_server.exists());

    let report = pair.close();
    assert!(report.is_clean());
    assert_eq!(report.removed.len(), 2);
    assert!(!paths.server_to_client.exists());
    assert!(!paths.client_to_server.exists());

    let again = cleanup(paths.iter());
    assert!(again.removed.is_empty());
    assert!(again.is_clean());
}

#[test]
fn dropping_the_pair_removes_socket_files() {
    let dir = tempdir().expect("temp dir");
    let paths = paths_in(dir.path(), "dropped");

    {
        let _pair = ChannelPair::provision(paths.clone()).expect("channels should bind");
    }

    assert!(!paths.server_to_client.exists());
    assert!(!paths.client_to_server.exists());
}

#[test]
fn provision_replaces_stale_files() {
    let dir = tempdir().expect("temp dir");
    let paths = paths_in(dir.path(), "stale");
    fs::write(&paths.server_to_client, b"left over").expect("write stale file");
    fs::write(&paths.client_to_server, b"left over").expect("write stale file");

    let pair = ChannelPair::provision(paths.clone()).expect("stale files should be cleared");
    UnixStream::connect(&paths.server_to_client).expect("listener should accept connects");
    drop(pair);
}

#[test]
fn cleanup_of_absent_paths_is_a_no_op() {
    let dir = tempdir().expect("temp dir");
    let paths = paths_in(dir.path(), "absent");

    let report = cleanup(paths.iter());
    assert!(report.removed.is_empty());
    assert!(report.failed.is_empty());
}

#[test]
fn binding_in_a_missing_directory_is_a_setup_error() {
    let dir = tempdir().expect("temp dir");
    let paths = paths_in(&dir.path().join("missing"), "nowhere");

    let err = ChannelPair::provision(paths).expect_err("bind should fail");
    assert!(matches!(err, HarnessError::Setup { .. }), "got {err:?}");
}
