//! Line protocol spoken over the channel pair, and the fixed four-step
//! sequence the harness drives through it.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::channel::ChannelPair;
use crate::config::MeasurementParameters;
use crate::device::DeviceProcess;
use crate::error::{HarnessError, HarnessResult};

/// Substring every conforming device includes in its `INITIALIZE` reply.
pub const DEVICE_IDENTITY: &str = "Dummy Finite Device";
pub const PARAMETERS_MARKER: &str = "PARAMETERS";
/// Parameter key expected in the `GETPARAMETERS` reply.
pub const PARAMETER_KEY: &str = "dataPoints";
pub const PARAMS_SET_MARKER: &str = "PARAMS_SET";
pub const FINISHED_MARKER: &str = "FINISHED";

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A command the harness sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Initialize,
    GetParameters,
    /// Carries the JSON-encoded parameter object.
    SetParameters(String),
    Finish,
}

impl Command {
    pub fn set_parameters(parameters: &MeasurementParameters) -> HarnessResult<Self> {
        Ok(Command::SetParameters(serde_json::to_string(parameters)?))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize => "INITIALIZE",
            Command::GetParameters => "GETPARAMETERS",
            Command::SetParameters(_) => "SETPARAMETERS",
            Command::Finish => "FINISH",
        }
    }

    /// The newline-terminated line written to the device.
    pub fn wire_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetParameters(payload) => write!(f, "{}:{payload}", self.name()),
            other => f.write_str(other.name()),
        }
    }
}

/// Response validator: every marker must appear in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    markers: Vec<String>,
}

impl Expectation {
    pub fn contains(marker: impl Into<String>) -> Self {
        Self {
            markers: vec![marker.into()],
        }
    }

    pub fn and(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn check(&self, response: &str) -> ExchangeOutcome {
        let missing: Vec<&str> = self
            .markers
            .iter()
            .filter(|marker| !response.contains(marker.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            ExchangeOutcome::Passed
        } else {
            ExchangeOutcome::Failed(format!("response lacks {}", missing.join(", ")))
        }
    }
}

/// Progress through the fixed command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SequenceState {
    Init,
    ParamsQueried,
    ParamsSet,
    Finished,
}

/// One exchange of the sequence and the state it advances to.
#[derive(Debug, Clone)]
pub struct Step {
    pub command: Command,
    pub expectation: Expectation,
    pub reaches: SequenceState,
}

/// `INITIALIZE`, `GETPARAMETERS`, `SETPARAMETERS:<json>`, `FINISH`.
pub fn standard_sequence(parameters: &MeasurementParameters) -> HarnessResult<Vec<Step>> {
    Ok(vec![
        Step {
            command: Command::Initialize,
            expectation: Expectation::contains(DEVICE_IDENTITY),
            reaches: SequenceState::Init,
        },
        Step {
            command: Command::GetParameters,
            expectation: Expectation::contains(PARAMETERS_MARKER).and(PARAMETER_KEY),
            reaches: SequenceState::ParamsQueried,
        },
        Step {
            command: Command::set_parameters(parameters)?,
            expectation: Expectation::contains(PARAMS_SET_MARKER),
            reaches: SequenceState::ParamsSet,
        },
        Step {
            command: Command::Finish,
            expectation: Expectation::contains(FINISHED_MARKER),
            reaches: SequenceState::Finished,
        },
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Passed,
    Failed(String),
}

/// A command sent and the response it produced.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    /// Command line without its trailing newline.
    pub command: String,
    pub response: String,
    pub outcome: ExchangeOutcome,
}

impl ExchangeRecord {
    pub fn passed(&self) -> bool {
        self.outcome == ExchangeOutcome::Passed
    }
}

/// Connected stream pair to the device.
#[derive(Debug)]
pub struct DeviceLink {
    writer: UnixStream,
    reader: UnixStream,
    response_timeout: Duration,
    max_response_len: usize,
}

impl DeviceLink {
    /// Accept the device's connection on the server-to-client channel, then on
    /// the client-to-server channel.
    ///
    /// Polls until `connect_timeout` elapses and fails early if the device
    /// process exits before connecting.
    pub fn handshake(
        channels: &ChannelPair,
        device: &mut DeviceProcess,
        connect_timeout: Duration,
        response_timeout: Duration,
        max_response_len: usize,
    ) -> HarnessResult<Self> {
        let deadline = Instant::now() + connect_timeout;

        let listener = channels
            .server_to_client
            .as_ref()
            .ok_or(HarnessError::ConnectionClosed)?;
        let writer = accept_polling(listener, "server-to-client", device, deadline)?;
        info!("server-to-client connected");

        let listener = channels
            .client_to_server
            .as_ref()
            .ok_or(HarnessError::ConnectionClosed)?;
        let reader = accept_polling(listener, "client-to-server", device, deadline)?;
        info!("client-to-server connected");

        reader.set_read_timeout(Some(response_timeout))?;

        Ok(Self {
            writer,
            reader,
            response_timeout,
            max_response_len: max_response_len.max(1),
        })
    }

    /// Write one command line, then read one response chunk and validate it.
    ///
    /// A response that is empty, not UTF-8, or lacks a marker yields a failed
    /// record. Only transport errors are returned as `Err`.
    pub fn exchange(
        &mut self,
        command: &Command,
        expectation: &Expectation,
    ) -> HarnessResult<ExchangeRecord> {
        let line = command.wire_line();
        debug!(command = %command, "sending");
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|err| match err.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                    HarnessError::ConnectionClosed
                }
                _ => HarnessError::Io(err),
            })?;

        let mut buf = vec![0u8; self.max_response_len];
        let read = loop {
            match self.reader.read(&mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(HarnessError::Timeout(self.response_timeout, "device response"))
                }
                Err(err) => return Err(err.into()),
            }
        };

        let command = command.to_string();
        if read == 0 {
            return Ok(ExchangeRecord {
                command,
                response: String::new(),
                outcome: ExchangeOutcome::Failed(
                    "connection closed before a response arrived".to_string(),
                ),
            });
        }

        let record = match std::str::from_utf8(&buf[..read]) {
            Ok(text) => {
                let response = text.trim_end().to_string();
                let outcome = expectation.check(&response);
                ExchangeRecord {
                    command,
                    response,
                    outcome,
                }
            }
            Err(err) => ExchangeRecord {
                command,
                response: String::from_utf8_lossy(&buf[..read]).trim_end().to_string(),
                outcome: ExchangeOutcome::Failed(format!("response is not valid UTF-8: {err}")),
            },
        };
        debug!(response = %record.response, passed = record.passed(), "received");
        Ok(record)
    }
}

fn accept_polling(
    listener: &UnixListener,
    label: &str,
    device: &mut DeviceProcess,
    deadline: Instant,
) -> HarnessResult<UnixStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if let Some(status) = device.try_status()? {
                    return Err(HarnessError::handshake(format!(
                        "device exited with {status} before connecting to {label}"
                    )));
                }
                if Instant::now() >= deadline {
                    return Err(HarnessError::handshake(format!(
                        "no connection on {label} before the connect deadline"
                    )));
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
