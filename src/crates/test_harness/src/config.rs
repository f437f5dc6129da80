use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix the .NET runtime uses for named pipes backed by Unix sockets.
pub const DEFAULT_CHANNEL_PREFIX: &str = "CoreFxPipe_";

/// Upper bound on a single response read.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 4096;

/// Opaque token that namespaces the channel pair of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier that will not collide with concurrent runs.
    pub fn generate() -> Self {
        Self(format!("test_comm_device_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Measurement settings sent with `SETPARAMETERS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementParameters {
    pub data_points: u32,
    pub measurement_type: String,
}

impl Default for MeasurementParameters {
    fn default() -> Self {
        Self {
            data_points: 5,
            measurement_type: "temperature".to_string(),
        }
    }
}

/// How validation failures feed into the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerdictPolicy {
    /// Only aborting errors fail the run; mismatched responses are reported.
    #[default]
    ErrorsOnly,
    /// Any failed exchange also fails the run.
    ValidationFailures,
}

/// Process-level and protocol configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Device simulator program to spawn.
    pub device_program: PathBuf,
    /// Arguments placed before the device identifier (e.g. a script path).
    pub device_args: Vec<String>,
    pub device_id: DeviceId,
    /// Directory that holds the channel sockets.
    pub socket_dir: PathBuf,
    pub channel_prefix: String,
    /// Extra environment variables applied to the child process.
    pub env: BTreeMap<String, String>,
    /// Optional working directory override for the child process.
    pub working_directory: Option<PathBuf>,
    /// Fixed pause after spawning, before the handshake starts polling.
    pub settle_delay: Duration,
    /// Upper bound on waiting for the device to connect to both channels.
    pub connect_timeout: Duration,
    /// Upper bound on a single response read.
    pub response_timeout: Duration,
    /// Upper bound on waiting for the device to exit, both after `FINISH`
    /// and after a termination signal.
    pub exit_timeout: Duration,
    pub max_response_len: usize,
    pub parameters: MeasurementParameters,
    /// Stop the sequence at the first failed validation.
    pub fail_fast: bool,
    pub verdict: VerdictPolicy,
}

impl HarnessConfig {
    /// Create a new config targeting a specific device simulator program.
    pub fn new(device_program: impl Into<PathBuf>) -> Self {
        Self {
            device_program: device_program.into(),
            device_args: Vec::new(),
            device_id: DeviceId::generate(),
            socket_dir: std::env::temp_dir(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            env: BTreeMap::new(),
            working_directory: None,
            settle_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            exit_timeout: Duration::from_secs(5),
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            parameters: MeasurementParameters::default(),
            fail_fast: false,
            verdict: VerdictPolicy::default(),
        }
    }

    /// Add an argument passed before the device identifier.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.device_args.push(arg.into());
        self
    }

    pub fn with_device_id(mut self, id: impl Into<DeviceId>) -> Self {
        self.device_id = id.into();
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Add an environment variable override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the working directory for the spawned process.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }

    pub fn with_parameters(mut self, parameters: MeasurementParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn with_verdict_policy(mut self, policy: VerdictPolicy) -> Self {
        self.verdict = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("test_comm_device_"));
    }

    #[test]
    fn validation_failures_do_not_fail_the_run_by_default() {
        let config = HarnessConfig::new("device");
        assert_eq!(config.verdict, VerdictPolicy::ErrorsOnly);
    }

    #[test]
    fn parameters_serialize_with_camel_case_keys() {
        let json = serde_json::to_value(MeasurementParameters::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"dataPoints": 5, "measurementType": "temperature"})
        );
    }
}
