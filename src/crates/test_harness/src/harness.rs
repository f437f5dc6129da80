use std::fmt;
use std::io::{self, Write};
use std::process::ExitStatus;

use tracing::{error, info, warn};

use crate::channel::{cleanup, ChannelPair, ChannelPaths, CleanupReport};
use crate::config::{DeviceId, HarnessConfig, VerdictPolicy};
use crate::device::{DeviceProcess, LogLine, Termination};
use crate::error::{HarnessError, HarnessResult};
use crate::protocol::{standard_sequence, Command, DeviceLink, ExchangeRecord, SequenceState};

const RULE_WIDTH: usize = 60;
const RESPONSE_PREVIEW_CHARS: usize = 100;

/// Runs the full communication scenario against one device simulator.
#[derive(Debug, Clone)]
pub struct DeviceHarness {
    config: HarnessConfig,
}

impl DeviceHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn channel_paths(&self) -> ChannelPaths {
        ChannelPaths::derive(
            &self.config.socket_dir,
            &self.config.channel_prefix,
            &self.config.device_id,
        )
    }

    /// Run the scenario, writing progress to stdout.
    pub fn run(&self) -> HarnessReport {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.run_with_output(&mut out)
    }

    /// Provision, spawn, handshake and exchange, then tear everything down
    /// regardless of how far the run got.
    pub fn run_with_output<W: Write>(&self, out: &mut W) -> HarnessReport {
        say(out, format_args!("{}", "=".repeat(RULE_WIDTH)));
        say(
            out,
            format_args!("Device communication test ({})", self.config.device_id),
        );
        say(out, format_args!("{}", "=".repeat(RULE_WIDTH)));

        let mut report = HarnessReport::new(self.config.device_id.clone(), self.config.verdict);
        let mut resources = Resources::default();

        if let Err(err) = self.drive(out, &mut resources, &mut report) {
            error!(error = %err, "harness run aborted");
            say(out, format_args!("\n❌ Test failed with error: {err}"));
            report.error = Some(err);
        }

        self.teardown(out, resources, &mut report);
        self.summarize(out, &report);
        report
    }

    fn drive<W: Write>(
        &self,
        out: &mut W,
        resources: &mut Resources,
        report: &mut HarnessReport,
    ) -> HarnessResult<()> {
        let config = &self.config;
        let steps = standard_sequence(&config.parameters)?;

        say(out, format_args!("\n[Server] Creating channels..."));
        let channels = resources
            .channels
            .insert(ChannelPair::provision(self.channel_paths())?);
        for path in channels.paths().iter() {
            say(out, format_args!("✓ Listening at {}", path.display()));
        }

        say(out, format_args!("\n[Device] Starting device simulator..."));
        let device = resources.device.insert(DeviceProcess::start(config)?);
        say(out, format_args!("✓ Device started with PID {}", device.pid()));

        say(out, format_args!("\n[Test] Waiting for device connections..."));
        let mut link = DeviceLink::handshake(
            channels,
            device,
            config.connect_timeout,
            config.response_timeout,
            config.max_response_len,
        )?;
        say(out, format_args!("✓ Both channels connected\n"));

        let mut chain_intact = true;
        let mut finish_sent = false;
        for (index, step) in steps.iter().enumerate() {
            say(out, format_args!("{}", "─".repeat(RULE_WIDTH)));
            say(
                out,
                format_args!("Test {}: {} command", index + 1, step.command.name()),
            );
            say(out, format_args!("{}", "─".repeat(RULE_WIDTH)));
            say(out, format_args!("→ Sending: {}", step.command));

            let record = link.exchange(&step.command, &step.expectation)?;
            finish_sent |= step.command == Command::Finish;
            say(
                out,
                format_args!("← Received: {}", echo(&step.command, &record.response)),
            );

            let passed = record.passed();
            if passed {
                say(out, format_args!("✅ {} test PASSED\n", step.command.name()));
                info!(command = step.command.name(), "exchange passed");
            } else {
                say(out, format_args!("❌ {} test FAILED\n", step.command.name()));
                warn!(command = step.command.name(), outcome = ?record.outcome, "exchange failed");
            }

            chain_intact &= passed;
            if chain_intact {
                report.reached = Some(step.reaches);
            }
            report.exchanges.push(record);

            if !passed && config.fail_fast {
                say(out, format_args!("Stopping sequence after failed exchange"));
                break;
            }
        }

        drop(link);

        if finish_sent {
            let status = device.wait(config.exit_timeout)?;
            info!(%status, "device exited after FINISH");
            report.device_exit = Some(status);
        }

        Ok(())
    }

    fn teardown<W: Write>(&self, out: &mut W, resources: Resources, report: &mut HarnessReport) {
        say(out, format_args!("\n[Cleanup]"));

        if let Some(mut device) = resources.device {
            match device.terminate(self.config.exit_timeout) {
                Ok(termination) => {
                    match termination {
                        Termination::AlreadyExited(_) => {}
                        Termination::Graceful(status) => {
                            say(out, format_args!("  Terminated device process ({status})"))
                        }
                        Termination::Killed(status) => {
                            say(out, format_args!("  Killed unresponsive device ({status})"))
                        }
                    }
                    report.termination = Some(termination);
                }
                Err(err) => {
                    warn!(error = %err, "failed to terminate device");
                    say(out, format_args!("  ⚠ Could not terminate device: {err}"));
                }
            }
            report.device_logs = device.logs();
        }

        if let Some(channels) = resources.channels {
            report.cleanup.merge(channels.close());
        }
        report.cleanup.merge(cleanup(self.channel_paths().iter()));

        for path in &report.cleanup.removed {
            say(out, format_args!("  ✓ Cleaned up {}", path.display()));
        }
        for (path, reason) in &report.cleanup.failed {
            say(
                out,
                format_args!("  ⚠ Could not remove {}: {reason}", path.display()),
            );
        }
        say(out, format_args!("  ✓ Cleanup complete"));
    }

    fn summarize<W: Write>(&self, out: &mut W, report: &HarnessReport) {
        say(out, format_args!("\n{}", "═".repeat(RULE_WIDTH)));
        if report.succeeded() {
            say(out, format_args!("✅ ALL COMMUNICATION TESTS PASSED!"));
        } else {
            say(
                out,
                format_args!(
                    "❌ COMMUNICATION TEST FAILED ({} of {} exchanges passed)",
                    report.passed_count(),
                    report.exchanges.len()
                ),
            );
        }
        say(out, format_args!("{}", "═".repeat(RULE_WIDTH)));
    }
}

#[derive(Default)]
struct Resources {
    channels: Option<ChannelPair>,
    device: Option<DeviceProcess>,
}

/// Everything observed during one harness run.
#[derive(Debug)]
pub struct HarnessReport {
    pub device_id: DeviceId,
    pub exchanges: Vec<ExchangeRecord>,
    /// Last state reached while every exchange so far had passed.
    pub reached: Option<SequenceState>,
    /// Exit status observed after `FINISH`.
    pub device_exit: Option<ExitStatus>,
    pub termination: Option<Termination>,
    pub cleanup: CleanupReport,
    /// Error that aborted the run, if any.
    pub error: Option<HarnessError>,
    pub device_logs: Vec<LogLine>,
    verdict: VerdictPolicy,
}

impl HarnessReport {
    fn new(device_id: DeviceId, verdict: VerdictPolicy) -> Self {
        Self {
            device_id,
            exchanges: Vec::new(),
            reached: None,
            device_exit: None,
            termination: None,
            cleanup: CleanupReport::default(),
            error: None,
            device_logs: Vec::new(),
            verdict,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.exchanges.iter().filter(|record| record.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.exchanges.len() - self.passed_count()
    }

    pub fn succeeded(&self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.verdict {
            VerdictPolicy::ErrorsOnly => true,
            VerdictPolicy::ValidationFailures => self.failed_count() == 0,
        }
    }

    /// Process exit code: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

fn say<W: Write>(out: &mut W, args: fmt::Arguments<'_>) {
    let _ = writeln!(out, "{args}");
}

/// Response as echoed to the progress output. Parameter dumps can be long,
/// so only those are shortened.
fn echo(command: &Command, response: &str) -> String {
    if *command == Command::GetParameters && response.chars().count() > RESPONSE_PREVIEW_CHARS
    {
        let head: String = response.chars().take(RESPONSE_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        response.to_string()
    }
}
