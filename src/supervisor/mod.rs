//! Supervised stdio backend
//!
//! Launches the configured stdio MCP server behind an SSE bridge in its own
//! process group and stops it in two phases on shutdown.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//! ```
//!
//! One mutex guards the process handle. `start`, `shutdown` and the exit
//! waiter all take it, and only the waiter clears the handle.

mod platform;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

pub use platform::Signal;

use crate::config::Config;

/// Exit polls after the terminate signal
const GRACE_POLLS: u32 = 10;
/// Interval between exit polls
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Final wait after the kill signal
const KILL_WAIT: Duration = Duration::from_millis(500);

/// Why a launch was refused or failed
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A process is already running or stopping
    #[error("backend process already running (pid {0})")]
    AlreadyRunning(u32),
    /// The shell could not be spawned
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Observable supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No process
    Idle,
    /// Launch in progress
    Starting,
    /// Process alive
    Running {
        /// Process id of the launching shell
        pid: u32,
    },
    /// Stop signals sent, waiting for exit
    Stopping,
}

/// What to run and how
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Shell command line
    pub command_line: String,
    /// Working directory
    pub work_dir: Option<PathBuf>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Executables that should be on `PATH`; missing ones are only warned about
    pub required_tools: Vec<String>,
}

impl LaunchSpec {
    /// Plain shell command with no extras
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            ..Self::default()
        }
    }

    /// Bridge launch for the `command` section
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the command line cannot be quoted.
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let command = &config.command;
        let command_line =
            command.shell_command(&config.backend.base_url, &config.backend.paths)?;

        let mut required_tools = Vec::new();
        if command.check_dependencies {
            required_tools.push("npx".to_string());
            let program = command.user_command.split_whitespace().next().unwrap_or_default();
            if matches!(program, "uv" | "uvx") {
                required_tools.push(program.to_string());
            }
        }

        Ok(Self {
            command_line,
            work_dir: command.work_dir.as_ref().map(PathBuf::from),
            env: command
                .env_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            required_tools,
        })
    }
}

struct Handle {
    pid: u32,
    pgid: Option<u32>,
    exited: watch::Receiver<bool>,
}

/// Owner of the backend process
#[derive(Clone)]
pub struct Supervisor {
    slot: Arc<Mutex<Option<Handle>>>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Idle supervisor
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            state: Arc::new(watch::Sender::new(SupervisorState::Idle)),
        }
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// State updates
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Whether a process handle exists
    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Launch `spec` unless a process already exists
    pub async fn start(&self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Err(SupervisorError::AlreadyRunning(handle.pid));
        }
        self.state.send_replace(SupervisorState::Starting);

        check_dependencies(&spec.required_tools);

        let mut command = platform::shell(&spec.command_line);
        platform::configure(&mut command);
        command
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.send_replace(SupervisorState::Idle);
                return Err(SupervisorError::Spawn(e));
            }
        };
        let Some(pid) = child.id() else {
            self.state.send_replace(SupervisorState::Idle);
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "process exited before its pid was read",
            )));
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        let (exited_tx, exited) = watch::channel(false);
        *slot = Some(Handle {
            pid,
            pgid: platform::group_id(pid),
            exited,
        });
        self.state.send_replace(SupervisorState::Running { pid });
        info!(pid, command = %spec.command_line, "Backend process started");

        let slot = Arc::clone(&self.slot);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let status = child.wait().await;

            let mut slot = slot.lock().await;
            if slot.as_ref().is_some_and(|h| h.pid == pid) {
                *slot = None;
            }
            state.send_replace(SupervisorState::Idle);
            let _ = exited_tx.send(true);
            drop(slot);

            match status {
                Ok(status) if status.success() => info!(pid, "Backend process exited"),
                Ok(status) => warn!(pid, status = %status, "Backend process exited with failure"),
                Err(e) => warn!(pid, error = %e, "Failed to wait for backend process"),
            }
        });

        Ok(pid)
    }

    /// Stop the process group: terminate, wait, kill, wait.
    ///
    /// A no-op when nothing runs. Safe to call concurrently.
    pub async fn shutdown(&self) {
        let (pid, pgid, mut exited) = {
            let slot = self.slot.lock().await;
            let Some(handle) = slot.as_ref() else {
                debug!("No backend process to stop");
                return;
            };
            self.state.send_replace(SupervisorState::Stopping);
            (handle.pid, handle.pgid, handle.exited.clone())
        };

        info!(pid, "Stopping backend process");
        deliver(pid, pgid, Signal::Terminate).await;
        if wait_exit(&mut exited, POLL_INTERVAL * GRACE_POLLS).await {
            return;
        }

        warn!(pid, "Backend process ignored terminate; killing");
        deliver(pid, pgid, Signal::Kill).await;
        if !wait_exit(&mut exited, KILL_WAIT).await {
            warn!(pid, "Backend process still running after kill");
        }
    }
}

async fn deliver(pid: u32, pgid: Option<u32>, signal: Signal) {
    if let Some(pgid) = pgid {
        match platform::signal_group(pgid, signal).await {
            Ok(()) => return,
            Err(e) => debug!(pgid, ?signal, error = %e, "Group signal failed, signalling process"),
        }
    }
    if let Err(e) = platform::signal_process(pid, signal).await {
        warn!(pid, ?signal, error = %e, "Failed to signal backend process");
    }
}

async fn wait_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
        Ok(Ok(_))
    )
}

fn check_dependencies(tools: &[String]) {
    for tool in tools {
        match which::which(tool) {
            Ok(path) => debug!(tool = %tool, path = %path.display(), "Found launch dependency"),
            Err(e) => warn!(tool = %tool, error = %e, "Launch dependency not found; starting anyway"),
        }
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(target: "subprocess", stream, "{line}");
            } else {
                info!(target: "subprocess", stream, "{line}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_bridges_configured_command() {
        let mut config = Config::default();
        config.command.enabled = true;
        config.command.user_command = "uvx mcp-server-time".to_string();
        config.command.env = vec!["TZ=UTC".to_string(), "broken".to_string()];
        config.command.work_dir = Some("/srv/mcp".to_string());
        config.apply_defaults();

        let spec = LaunchSpec::from_config(&config).unwrap();

        assert!(spec.command_line.starts_with("npx -y supergateway --stdio"));
        assert!(spec.command_line.contains("--port 8000"));
        assert_eq!(spec.env, vec![("TZ".to_string(), "UTC".to_string())]);
        assert_eq!(spec.work_dir, Some(PathBuf::from("/srv/mcp")));
        assert_eq!(spec.required_tools, vec!["npx", "uvx"]);
    }

    #[test]
    fn dependency_check_can_be_disabled() {
        let mut config = Config::default();
        config.command.user_command = "node server.js".to_string();
        config.command.check_dependencies = false;
        config.apply_defaults();

        assert!(LaunchSpec::from_config(&config).unwrap().required_tools.is_empty());
    }

    /// Log sink shared with the fmt subscriber
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn stderr_is_logged_as_warning_and_stdout_as_info() {
        // GIVEN: a subscriber capturing formatted events on this thread
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // WHEN: one line arrives on each stream
        forward_output(b"listening on 8000\n".as_slice(), "stdout");
        forward_output(b"deprecated flag\n".as_slice(), "stderr");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(captured.text().contains("listening on 8000")
                && captured.text().contains("deprecated flag"))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // THEN: the levels follow the stream
        let text = captured.text();
        let line_with = |needle: &str| {
            text.lines()
                .find(|line| line.contains(needle))
                .unwrap()
                .to_string()
        };
        assert!(line_with("deprecated flag").contains("WARN"));
        assert!(line_with("listening on 8000").contains("INFO"));
        assert!(line_with("deprecated flag").contains("subprocess"));
    }

    #[tokio::test]
    async fn shutdown_without_process_is_a_noop() {
        let supervisor = Supervisor::new();
        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(!supervisor.is_running().await);
    }
}
