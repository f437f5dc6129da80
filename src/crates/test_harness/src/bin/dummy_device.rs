use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use device_comm_harness::{ChannelPaths, DeviceId, DEFAULT_CHANNEL_PREFIX};
use nix::sys::signal::{signal, SigHandler, Signal};
use serde_json::{json, Map, Value};

const IDENTITY: &str = "INITIALIZED:Dummy Finite Device v1.0";

/// Fault injected through `DUMMY_DEVICE_BEHAVIOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Conforming,
    /// Exit before connecting to either channel.
    ExitEarly,
    /// Answer `INITIALIZE` without the identity string.
    WrongIdentity,
    /// Connect and never answer.
    Hang,
    /// Like `Hang`, and ignore SIGTERM as well.
    IgnoreTerm,
    /// Close the reply channel right after connecting but keep reading commands.
    CloseOutput,
    /// Prefix the `INITIALIZE` reply with bytes that are not UTF-8.
    BadUtf8,
}

impl Behavior {
    fn from_env() -> Self {
        match std::env::var("DUMMY_DEVICE_BEHAVIOR").as_deref() {
            Ok("exit-early") => Behavior::ExitEarly,
            Ok("wrong-identity") => Behavior::WrongIdentity,
            Ok("hang") => Behavior::Hang,
            Ok("ignore-term") => Behavior::IgnoreTerm,
            Ok("close-output") => Behavior::CloseOutput,
            Ok("bad-utf8") => Behavior::BadUtf8,
            _ => Behavior::Conforming,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let device_id = std::env::args()
        .nth(1)
        .ok_or("usage: dummy_device <device-id>")?;
    let behavior = Behavior::from_env();
    println!("dummy device {device_id} starting ({behavior:?})");

    if behavior == Behavior::ExitEarly {
        eprintln!("exiting before connecting");
        std::process::exit(3);
    }
    if behavior == Behavior::IgnoreTerm {
        // SAFETY: installs SIG_IGN, no handler code runs.
        unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }?;
    }

    let paths = ChannelPaths::derive(
        &std::env::temp_dir(),
        DEFAULT_CHANNEL_PREFIX,
        &DeviceId::new(device_id),
    );
    let inbound = connect(&paths.server_to_client)?;
    let mut outbound = Some(connect(&paths.client_to_server)?);
    println!("connected to both channels");
    if behavior == Behavior::CloseOutput {
        outbound = None;
        println!("closed reply channel");
    }

    if matches!(behavior, Behavior::Hang | Behavior::IgnoreTerm) {
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }

    let mut parameters = default_parameters();
    let reader = BufReader::new(inbound);
    for line in reader.lines() {
        let line = line?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        println!("received {command}");

        let (reply, done) = handle_command(command, &mut parameters, behavior);
        if let Some(outbound) = outbound.as_mut() {
            let mut frame = Vec::with_capacity(reply.len() + 3);
            if behavior == Behavior::BadUtf8 && command == "INITIALIZE" {
                frame.extend_from_slice(&[0xff, 0xfe]);
            }
            frame.extend_from_slice(reply.as_bytes());
            frame.push(b'\n');
            outbound.write_all(&frame)?;
            outbound.flush()?;
        }
        if done {
            break;
        }
    }

    println!("dummy device finished");
    Ok(())
}

fn handle_command(
    command: &str,
    parameters: &mut Map<String, Value>,
    behavior: Behavior,
) -> (String, bool) {
    let (name, payload) = match command.split_once(':') {
        Some((name, payload)) => (name, Some(payload)),
        None => (command, None),
    };

    match name {
        "INITIALIZE" if behavior == Behavior::WrongIdentity => {
            ("INITIALIZED:Unknown Device".to_string(), false)
        }
        "INITIALIZE" => (IDENTITY.to_string(), false),
        "GETPARAMETERS" => (
            format!("PARAMETERS:{}", Value::Object(parameters.clone())),
            false,
        ),
        "SETPARAMETERS" => match payload {
            Some(json) => match serde_json::from_str::<Map<String, Value>>(json) {
                Ok(update) => {
                    parameters.extend(update);
                    ("PARAMS_SET".to_string(), false)
                }
                Err(err) => (format!("ERROR:invalid parameters: {err}"), false),
            },
            None => ("ERROR:missing parameters".to_string(), false),
        },
        "FINISH" => ("FINISHED".to_string(), true),
        other => (format!("ERROR:unknown command {other}"), false),
    }
}

fn default_parameters() -> Map<String, Value> {
    match json!({
        "dataPoints": 10,
        "measurementType": "voltage",
        "intervalMs": 100
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn connect(path: &Path) -> std::io::Result<UnixStream> {
    let mut attempts = 0;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err) if attempts < 50 => {
                attempts += 1;
                eprintln!("waiting for {}: {err}", path.display());
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(err),
        }
    }
}
