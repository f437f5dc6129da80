use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::DeviceId;
use crate::error::{HarnessError, HarnessResult};

/// Filesystem locations of the two channel sockets for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    /// Harness writes, device reads.
    pub server_to_client: PathBuf,
    /// Device writes, harness reads.
    pub client_to_server: PathBuf,
}

impl ChannelPaths {
    /// Build `<dir>/<prefix>serverToClient_<id>` and `<dir>/<prefix>clientToServer_<id>`.
    pub fn derive(dir: &Path, prefix: &str, device_id: &DeviceId) -> Self {
        Self {
            server_to_client: dir.join(format!("{prefix}serverToClient_{device_id}")),
            client_to_server: dir.join(format!("{prefix}clientToServer_{device_id}")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [self.server_to_client.as_path(), self.client_to_server.as_path()].into_iter()
    }
}

/// Outcome of a best-effort cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Paths that existed but could not be removed, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

/// Remove any socket files left at `paths`. Missing files are not an error,
/// and removal failures are logged and collected rather than returned.
pub fn cleanup<'a>(paths: impl IntoIterator<Item = &'a Path>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed channel file");
                report.removed.push(path.to_path_buf());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not remove channel file");
                report.failed.push((path.to_path_buf(), err.to_string()));
            }
        }
    }
    report
}

/// Both listening endpoints for one device. Socket files are removed when the
/// pair is closed or dropped.
#[derive(Debug)]
pub struct ChannelPair {
    paths: ChannelPaths,
    pub(crate) server_to_client: Option<UnixListener>,
    pub(crate) client_to_server: Option<UnixListener>,
}

impl ChannelPair {
    /// Clear stale files and bind both listeners.
    pub fn provision(paths: ChannelPaths) -> HarnessResult<Self> {
        cleanup(paths.iter());

        let server_to_client = bind(&paths.server_to_client)?;
        debug!(path = %paths.server_to_client.display(), "server-to-client channel listening");
        let client_to_server = match bind(&paths.client_to_server) {
            Ok(listener) => listener,
            Err(err) => {
                drop(server_to_client);
                cleanup(paths.iter());
                return Err(err);
            }
        };
        debug!(path = %paths.client_to_server.display(), "client-to-server channel listening");

        Ok(Self {
            paths,
            server_to_client: Some(server_to_client),
            client_to_server: Some(client_to_server),
        })
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// Close both listeners and remove the socket files.
    pub fn close(mut self) -> CleanupReport {
        self.release()
    }

    fn release(&mut self) -> CleanupReport {
        self.server_to_client.take();
        self.client_to_server.take();
        cleanup(self.paths.iter())
    }
}

impl Drop for ChannelPair {
    fn drop(&mut self) {
        if self.server_to_client.is_some() || self.client_to_server.is_some() {
            self.release();
        }
    }
}

fn bind(path: &Path) -> HarnessResult<UnixListener> {
    UnixListener::bind(path).map_err(|err| HarnessError::setup(path, err))
}
