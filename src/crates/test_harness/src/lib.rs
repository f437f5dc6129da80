//! Harness for checking the pipe protocol between the lab-control application
//! and a measurement device simulator.
//!
//! The harness plays the application side: it binds the two Unix sockets the
//! device expects, spawns the simulator with a device identifier, accepts its
//! connections and drives `INITIALIZE`, `GETPARAMETERS`, `SETPARAMETERS` and
//! `FINISH` through them, validating each response.
//!
//! Typical usage:
//! ```no_run
//! use device_comm_harness::{DeviceHarness, HarnessConfig};
//!
//! let config = HarnessConfig::new("python3")
//!     .with_arg("/opt/devices/dummy_finite_measurement.py");
//! let report = DeviceHarness::new(config).run();
//! for exchange in &report.exchanges {
//!     println!("{} -> {} ({:?})", exchange.command, exchange.response, exchange.outcome);
//! }
//! std::process::exit(i32::from(report.exit_code()));
//! ```

mod channel;
mod config;
mod device;
mod error;
mod harness;
mod protocol;

pub use channel::{cleanup, ChannelPair, ChannelPaths, CleanupReport};
pub use config::{
    DeviceId, HarnessConfig, MeasurementParameters, VerdictPolicy, DEFAULT_CHANNEL_PREFIX,
    DEFAULT_MAX_RESPONSE_LEN,
};
pub use device::{DeviceProcess, LogLine, LogStream, Termination};
pub use error::{HarnessError, HarnessResult};
pub use harness::{DeviceHarness, HarnessReport};
pub use protocol::{
    standard_sequence, Command, DeviceLink, ExchangeOutcome, ExchangeRecord, Expectation,
    SequenceState, Step, DEVICE_IDENTITY, FINISHED_MARKER, PARAMETERS_MARKER, PARAMETER_KEY,
    PARAMS_SET_MARKER,
};
