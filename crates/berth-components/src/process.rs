//! Spawning backend processes.
//!
//! A backend is started with its launch configuration as one JSON document
//! on stdin (then stdin is closed) and `--data-dir <path>` on the command
//! line. It must print its control endpoint as the first line of stdout
//! within the announce timeout. Everything it prints afterwards, and all of
//! stderr, goes to the log.
//!
//! The supervisor only ever sees a [`ProcessHandle`]: a pid, the announced
//! endpoint, an exit watch, and a kill switch. Tests substitute their own
//! [`ProcessLauncher`].

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{ComponentId, Scope, Version};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::control::ControlEndpoint;
use crate::error::{ComponentError, ComponentResult};

/// Everything needed to start one backend process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Component being started.
    pub component_id: ComponentId,
    /// Version being started.
    pub version: Version,
    /// Executable to run.
    pub executable: PathBuf,
    /// The instance's data directory. Created before spawn.
    pub data_dir: PathBuf,
    /// Owning scope.
    pub scope: Scope,
    /// Free-form configuration from the app manifest.
    pub config: serde_json::Value,
    /// Budget for the endpoint announcement.
    pub announce_timeout: Duration,
}

impl LaunchSpec {
    /// The JSON document written to the process's stdin.
    #[must_use]
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            component_id: self.component_id.clone(),
            version: self.version,
            data_dir: self.data_dir.clone(),
            scope: self.scope.as_segment().to_string(),
            config: self.config.clone(),
        }
    }
}

/// Launch configuration as seen by the component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// The component's own id.
    pub component_id: ComponentId,
    /// The version being run.
    pub version: Version,
    /// Where to keep persistent data.
    pub data_dir: PathBuf,
    /// `shared` or a user id.
    pub scope: String,
    /// Manifest-supplied configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the exit status was success.
    pub success: bool,
    /// Human-readable description, e.g. `exit status: 3`.
    pub description: String,
}

impl ExitReport {
    /// Build from an OS exit status.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            description: status.to_string(),
        }
    }

    /// An exit with the given code.
    #[must_use]
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
            description: format!("exit status: {code}"),
        }
    }

    /// The process could no longer be observed.
    #[must_use]
    pub fn lost(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            success: false,
            description: reason.into(),
        }
    }
}

/// Supervisor-side view of a running process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    endpoint: ControlEndpoint,
    exit: watch::Receiver<Option<ExitReport>>,
    kill: mpsc::Sender<()>,
}

/// Launcher-side counterpart of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessSignals {
    exit: watch::Sender<Option<ExitReport>>,
    kill: mpsc::Receiver<()>,
}

impl ProcessHandle {
    /// Create a handle and the signals its launcher drives.
    #[must_use]
    pub fn channel(pid: Option<u32>, endpoint: ControlEndpoint) -> (Self, ProcessSignals) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        (
            Self {
                pid,
                endpoint,
                exit: exit_rx,
                kill: kill_tx,
            },
            ProcessSignals {
                exit: exit_tx,
                kill: kill_rx,
            },
        )
    }

    /// OS process id, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The announced control endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// The exit report, once the process has ended.
    #[must_use]
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to end.
    pub async fn wait(&self) -> ExitReport {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(report) => report
                .as_ref()
                .cloned()
                .unwrap_or_else(|| ExitReport::lost("process watcher ended")),
            Err(_) => ExitReport::lost("process watcher ended"),
        }
    }

    /// Forcibly terminate the process. Idempotent.
    pub fn kill(&self) {
        let _ = self.kill.try_send(());
    }
}

impl ProcessSignals {
    /// Publish the exit report.
    pub fn report_exit(&self, report: ExitReport) {
        self.exit.send_replace(Some(report));
    }

    /// Wait until a kill is requested. Returns `false` if every handle was
    /// dropped instead.
    pub async fn killed(&mut self) -> bool {
        self.kill.recv().await.is_some()
    }
}

/// Starts backend processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a process and wait for its endpoint announcement.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::StartFailed`] if the process cannot be
    /// spawned, exits before announcing, announces garbage, or stays silent
    /// past `spec.announce_timeout`. The process is killed in every case.
    async fn launch(&self, spec: &LaunchSpec) -> ComponentResult<ProcessHandle>;
}

/// Launches real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLauncher;

#[async_trait]
impl ProcessLauncher for OsProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> ComponentResult<ProcessHandle> {
        let start_failed = |reason: String| ComponentError::StartFailed {
            component: spec.component_id.clone(),
            version: spec.version,
            reason,
        };

        tokio::fs::create_dir_all(&spec.data_dir)
            .await
            .map_err(|e| ComponentError::io(&spec.data_dir, &e))?;

        let mut child = Command::new(&spec.executable)
            .arg("--data-dir")
            .arg(&spec.data_dir)
            .current_dir(&spec.data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| start_failed(format!("could not spawn {}: {e}", spec.executable.display())))?;
        let pid = child.id();
        debug!(component_id = %spec.component_id, version = %spec.version, ?pid, "Spawned component");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, spec.component_id.clone(), Stream::Stderr));
        }

        if let Some(mut stdin) = child.stdin.take() {
            let mut config = serde_json::to_vec(&spec.launch_config())
                .map_err(|e| start_failed(format!("failed to encode launch config: {e}")))?;
            config.push(b'\n');
            if let Err(e) = stdin.write_all(&config).await {
                debug!(component_id = %spec.component_id, error = %e, "Could not write launch config");
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_failed("stdout was not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let announced = tokio::time::timeout(spec.announce_timeout, lines.next_line()).await;
        let endpoint = match announced {
            Ok(Ok(Some(line))) => match ControlEndpoint::parse(&line) {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    abort(&mut child).await;
                    return Err(start_failed(format!("announced an invalid endpoint '{}'", line.trim())));
                },
            },
            Ok(Ok(None)) => {
                let status = exit_description(&mut child).await;
                return Err(start_failed(format!("exited before announcing its endpoint ({status})")));
            },
            Ok(Err(e)) => {
                abort(&mut child).await;
                return Err(start_failed(format!("failed to read endpoint announcement: {e}")));
            },
            Err(_) => {
                abort(&mut child).await;
                return Err(start_failed(format!(
                    "did not announce an endpoint within {:?}",
                    spec.announce_timeout
                )));
            },
        };

        tokio::spawn(forward_lines(lines, spec.component_id.clone()));

        let (handle, signals) = ProcessHandle::channel(pid, endpoint);
        tokio::spawn(watch_child(child, signals, spec.component_id.clone()));

        info!(
            component_id = %spec.component_id,
            version = %spec.version,
            ?pid,
            endpoint = %handle.endpoint(),
            "Component announced endpoint"
        );
        Ok(handle)
    }
}

async fn watch_child(mut child: Child, mut signals: ProcessSignals, component_id: ComponentId) {
    let status = tokio::select! {
        status = child.wait() => status,
        requested = signals.killed() => {
            if requested {
                debug!(component_id = %component_id, "Killing component process");
            }
            let _ = child.start_kill();
            child.wait().await
        },
    };
    let report = match status {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => ExitReport::lost(format!("failed to wait for process: {e}")),
    };
    debug!(component_id = %component_id, exit = %report.description, "Component process ended");
    signals.report_exit(report);
}

async fn abort(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn exit_description(child: &mut Child) -> String {
    match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("wait failed: {e}"),
        Err(_) => {
            abort(child).await;
            "closed stdout".to_string()
        },
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_output<R>(reader: R, component_id: ComponentId, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log_line(&component_id, stream, &line);
    }
}

async fn forward_lines<R>(mut lines: tokio::io::Lines<BufReader<R>>, component_id: ComponentId)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        log_line(&component_id, Stream::Stdout, &line);
    }
}

fn log_line(component_id: &ComponentId, stream: Stream, line: &str) {
    match stream {
        Stream::Stdout => debug!(component_id = %component_id, "{line}"),
        Stream::Stderr => warn!(component_id = %component_id, stream = "stderr", "{line}"),
    }
}

/// Whether `path` looks like something [`OsProcessLauncher`] can execute.
#[must_use]
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("component.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(dir: &Path, executable: PathBuf, timeout: Duration) -> LaunchSpec {
        LaunchSpec {
            component_id: ComponentId::from_static("com.example.notes"),
            version: Version::new(1, 0, 0),
            executable,
            data_dir: dir.join("data"),
            scope: Scope::Shared,
            config: serde_json::json!({"greeting": "hi"}),
            announce_timeout: timeout,
        }
    }

    #[test]
    fn launch_config_wire_format() {
        let dir = Path::new("/tmp");
        let spec = spec(dir, PathBuf::from("/bin/true"), Duration::from_secs(1));
        let json = serde_json::to_value(spec.launch_config()).unwrap();
        assert_eq!(json["componentId"], "com.example.notes");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["dataDir"], "/tmp/data");
        assert_eq!(json["scope"], "shared");
        assert_eq!(json["config"]["greeting"], "hi");
    }

    #[tokio::test]
    async fn reads_announcement_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "read cfg\necho tcp://127.0.0.1:4100\nexit 3");
        let handle = OsProcessLauncher
            .launch(&spec(dir.path(), exe, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(handle.endpoint().port(), 4100);
        assert!(dir.path().join("data").is_dir());
        let exit = handle.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success);
    }

    #[tokio::test]
    async fn early_exit_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "exit 7");
        let err = OsProcessLauncher
            .launch(&spec(dir.path(), exe, Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            ComponentError::StartFailed { reason, .. } => assert!(reason.contains("before announcing")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silence_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "sleep 30");
        let err = OsProcessLauncher
            .launch(&spec(dir.path(), exe, Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::StartFailed { .. }));
    }

    #[tokio::test]
    async fn kill_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo tcp://127.0.0.1:4101\nsleep 30");
        let handle = OsProcessLauncher
            .launch(&spec(dir.path(), exe, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(handle.exit_report().is_none());
        handle.kill();
        let exit = handle.wait().await;
        assert!(!exit.success);
    }

    #[test]
    fn executable_check() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "true");
        assert!(is_executable(&exe));
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"x").unwrap();
        assert!(!is_executable(&plain));
    }
}
