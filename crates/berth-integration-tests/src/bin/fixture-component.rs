//! A component process for end-to-end tests.
//!
//! Reads its launch configuration from stdin, records the launch in its data
//! directory, announces a `tcp://` endpoint on stdout and answers status and
//! stop calls. `config.fixture.mode` makes it misbehave:
//!
//! - `hang`: never announce.
//! - `exit_early`: exit with an error before announcing.
//! - `crash`: exit with status 3 `crash_after_ms` after announcing.
//! - `crash_once`: like `crash`, but only on the first launch in a data dir.
//! - `ignore_stop`: acknowledge stop calls and keep running.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use berth_components::LaunchConfig;
use berth_components::control::{ControlRequest, ControlResponse};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Name of the file each launch appends its version to.
const LAUNCH_LOG: &str = "launches.log";
/// Marker left by `crash_once`.
const CRASH_MARKER: &str = "crashed-once";
/// Exit status used for deliberate crashes.
const CRASH_STATUS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Hang,
    ExitEarly,
    Crash,
    CrashOnce,
    IgnoreStop,
}

#[derive(Debug, Clone, Copy)]
struct Behaviour {
    mode: Mode,
    crash_after: Duration,
}

impl Behaviour {
    fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
        let fixture = &config["fixture"];
        let mode = match fixture["mode"].as_str().unwrap_or("normal") {
            "normal" => Mode::Normal,
            "hang" => Mode::Hang,
            "exit_early" => Mode::ExitEarly,
            "crash" => Mode::Crash,
            "crash_once" => Mode::CrashOnce,
            "ignore_stop" => Mode::IgnoreStop,
            other => bail!("unknown fixture mode '{other}'"),
        };
        let crash_after = Duration::from_millis(fixture["crash_after_ms"].as_u64().unwrap_or(50));
        Ok(Self { mode, crash_after })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read launch config")?;
    let launch: LaunchConfig =
        serde_json::from_str(input.trim()).context("launch config is not valid JSON")?;
    let data_dir = data_dir_arg().unwrap_or_else(|| launch.data_dir.clone());
    let behaviour = Behaviour::from_config(&launch.config)?;

    record_launch(&data_dir, &launch)?;

    match behaviour.mode {
        Mode::ExitEarly => bail!("configured to exit before announcing"),
        Mode::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(());
        },
        _ => {},
    }

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind control listener")?;
    let port = listener.local_addr()?.port();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "tcp://127.0.0.1:{port}")?;
    stdout.flush()?;
    eprintln!("{} {} listening on {port}", launch.component_id, launch.version);

    let crash = match behaviour.mode {
        Mode::Crash => true,
        Mode::CrashOnce => {
            let marker = data_dir.join(CRASH_MARKER);
            let first = !marker.exists();
            if first {
                std::fs::write(&marker, b"")?;
            }
            first
        },
        _ => false,
    };

    if crash {
        tokio::select! {
            result = serve(&listener, &launch, behaviour.mode) => result,
            () = tokio::time::sleep(behaviour.crash_after) => {
                eprintln!("crashing on purpose");
                std::process::exit(CRASH_STATUS);
            },
        }
    } else {
        serve(&listener, &launch, behaviour.mode).await
    }
}

fn data_dir_arg() -> Option<PathBuf> {
    let mut args = std::env::args_os().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--data-dir" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

/// Append the version to the launch log and keep the last config around.
fn record_launch(data_dir: &Path, launch: &LaunchConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join(LAUNCH_LOG))
        .context("failed to open launch log")?;
    writeln!(log, "{}", launch.version)?;
    std::fs::write(
        data_dir.join("launch.json"),
        serde_json::to_vec_pretty(launch)?,
    )?;
    Ok(())
}

async fn serve(listener: &TcpListener, launch: &LaunchConfig, mode: Mode) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let stop = match answer(stream, launch).await {
            Ok(stop) => stop,
            Err(e) => {
                eprintln!("control call failed: {e:#}");
                false
            },
        };
        if stop && mode != Mode::IgnoreStop {
            return Ok(());
        }
    }
}

/// Answer one call. Returns whether it was a stop request.
async fn answer(stream: TcpStream, launch: &LaunchConfig) -> anyhow::Result<bool> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read).read_line(&mut line).await?;

    let (reply, stop) = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(ControlRequest::Status) => (
            ControlResponse {
                ok: true,
                state: Some("running".into()),
                version: Some(launch.version.to_string()),
                error: None,
            },
            false,
        ),
        Ok(ControlRequest::Stop) => (
            ControlResponse {
                ok: true,
                state: Some("stopping".into()),
                version: None,
                error: None,
            },
            true,
        ),
        Err(e) => (
            ControlResponse {
                ok: false,
                state: None,
                version: None,
                error: Some(format!("bad request: {e}")),
            },
            false,
        ),
    };

    let mut bytes = serde_json::to_vec(&reply)?;
    bytes.push(b'\n');
    write.write_all(&bytes).await?;
    write.flush().await?;
    Ok(stop)
}
