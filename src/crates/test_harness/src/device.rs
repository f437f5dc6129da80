use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Origin stream for captured device output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Single captured output line with its source.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// How the device process ended during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The device had already exited on its own.
    AlreadyExited(ExitStatus),
    /// The device exited after SIGTERM.
    Graceful(ExitStatus),
    /// The device ignored SIGTERM and was killed.
    Killed(ExitStatus),
}

/// Handle to a running device simulator process.
pub struct DeviceProcess {
    child: Child,
    log_buffer: Arc<Mutex<Vec<LogLine>>>,
    log_readers: Vec<thread::JoinHandle<()>>,
    /// Signalled by each reader once its pipe reaches end-of-stream.
    readers_done: mpsc::Receiver<LogStream>,
    /// Upper bound on waiting for the readers after the device exits.
    drain_timeout: Duration,
}

impl DeviceProcess {
    /// Spawn the device program with the device identifier as its last argument.
    pub fn start(config: &HarnessConfig) -> HarnessResult<Self> {
        let mut cmd = Command::new(&config.device_program);
        cmd.args(&config.device_args);
        cmd.arg(config.device_id.as_str());

        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(&config.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            HarnessError::spawn(format!("{}: {err}", config.device_program.display()))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::spawn("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::spawn("failed to capture stderr"))?;

        let log_buffer = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, readers_done) = mpsc::channel();
        let log_readers = vec![
            spawn_log_reader(stdout, LogStream::Stdout, log_buffer.clone(), done_tx.clone()),
            spawn_log_reader(stderr, LogStream::Stderr, log_buffer.clone(), done_tx),
        ];

        info!(pid = child.id(), device_id = %config.device_id, "device started");

        if !config.settle_delay.is_zero() {
            thread::sleep(config.settle_delay);
        }

        Ok(Self {
            child,
            log_buffer,
            log_readers,
            readers_done,
            drain_timeout: config.exit_timeout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Exit status if the device has already exited.
    pub fn try_status(&mut self) -> HarnessResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Block until the device exits or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> HarnessResult<ExitStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!(%status, "device exited");
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                return Err(HarnessError::Timeout(timeout, "device exit"));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Send SIGTERM and wait up to `timeout`, then kill the device if it is
    /// still running.
    pub fn terminate(&mut self, timeout: Duration) -> HarnessResult<Termination> {
        if let Some(status) = self.child.try_wait()? {
            self.join_log_readers();
            return Ok(Termination::AlreadyExited(status));
        }

        info!(pid = self.pid(), "terminating device");
        match self.signal(Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(HarnessError::Io(errno.into())),
        }

        let termination = match self.wait(timeout) {
            Ok(status) => Termination::Graceful(status),
            Err(HarnessError::Timeout(..)) => {
                warn!(pid = self.pid(), ?timeout, "device ignored SIGTERM; killing");
                self.child.kill()?;
                Termination::Killed(self.child.wait()?)
            }
            Err(err) => return Err(err),
        };
        self.join_log_readers();
        Ok(termination)
    }

    /// Snapshot of the captured stdout and stderr lines.
    pub fn logs(&self) -> Vec<LogLine> {
        self.log_buffer
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    fn signal(&self, signal: Signal) -> Result<(), Errno> {
        let pid = i32::try_from(self.child.id()).map_err(|_| Errno::ESRCH)?;
        kill(Pid::from_raw(pid), signal)
    }

    /// Join the output readers once both pipes close, or detach them when a
    /// leftover grandchild keeps a pipe open past the drain timeout.
    fn join_log_readers(&mut self) {
        if self.log_readers.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut finished = 0;
        while finished < self.log_readers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.readers_done.recv_timeout(remaining) {
                Ok(_) => finished += 1,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        pid = self.pid(),
                        timeout = ?self.drain_timeout,
                        "device output still open after exit; detaching readers"
                    );
                    self.log_readers.clear();
                    return;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        for handle in self.log_readers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.join_log_readers();
    }
}

fn spawn_log_reader<R: Read + Send + 'static>(
    reader: R,
    stream: LogStream,
    buffer: Arc<Mutex<Vec<LogLine>>>,
    done: mpsc::Sender<LogStream>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let buf_reader = BufReader::new(reader);
        for line in buf_reader.lines().map_while(Result::ok) {
            let line = line.trim().to_string();
            debug!(?stream, %line, "device output");
            if let Ok(mut guard) = buffer.lock() {
                guard.push(LogLine { stream, line });
            }
        }
        let _ = done.send(stream);
    })
}
