//! Dev server supervision - preparing, launching and tearing down the
//! preview server that hosts the embedding page

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::SetupError;
use crate::port::allocate_port;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Placeholder substituted with the allocated port in server arguments
pub const PORT_PLACEHOLDER: &str = "{port}";

/// How to decide that a freshly launched server is ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Poll the base URL until it answers with a success status
    Poll { timeout_ms: u64, interval_ms: u64 },
    /// Sleep for a fixed warm-up interval
    Delay { ms: u64 },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Poll {
            timeout_ms: 30_000,
            interval_ms: 100,
        }
    }
}

/// Configuration for the dev server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Working directory of the preview app
    pub dir: PathBuf,

    /// Dependency preparation command (empty = none)
    pub prepare: Vec<String>,

    /// Preparation is skipped when this path (relative to `dir`) exists
    pub prepare_marker: Option<PathBuf>,

    /// Server command; `{port}` is replaced with the bound port
    pub command: Vec<String>,

    /// Fixed port (None = allocate a free one)
    pub port: Option<u16>,

    pub readiness: Readiness,

    /// Launches attempted when the server dies during startup
    pub launch_attempts: usize,

    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace_ms: u64,

    /// Forward server stdout/stderr instead of discarding it
    pub inherit_output: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("test_server"),
            prepare: vec!["npm".to_string(), "install".to_string()],
            prepare_marker: Some(PathBuf::from("node_modules")),
            command: vec![
                "./node_modules/.bin/webpack-dev-server".to_string(),
                "--port".to_string(),
                PORT_PLACEHOLDER.to_string(),
            ],
            port: None,
            readiness: Readiness::default(),
            launch_attempts: 3,
            stop_grace_ms: 2_000,
            inherit_output: false,
        }
    }
}

enum Startup {
    Ready,
    Exited(ExitStatus),
}

/// Handle to a running dev server process.
///
/// The process (and its process group) is torn down by [`DevServer::stop`]
/// or, failing that, when the handle is dropped.
pub struct DevServer {
    child: Option<Child>,
    /// Exit status once observed; the leader has been reaped by then
    exited: Option<ExitStatus>,
    base_url: String,
    port: u16,
    stop_grace: Duration,
}

impl DevServer {
    /// Prepare dependencies, launch the server and wait until it is ready
    pub async fn start(config: &ServerConfig) -> Result<Self, SetupError> {
        if config.command.is_empty() {
            return Err(SetupError::InvalidConfig(
                "server command is empty".to_string(),
            ));
        }

        prepare(config).await?;

        let attempts = config.launch_attempts.max(1);
        for attempt in 1..=attempts {
            let port = match config.port {
                Some(port) => port,
                None => allocate_port()?,
            };

            let mut server = Self::launch(config, port)?;
            match server.wait_ready(&config.readiness).await? {
                Startup::Ready => {
                    info!("Dev server is ready at {}", server.base_url);
                    return Ok(server);
                }
                Startup::Exited(status) => {
                    warn!(
                        "Dev server exited during startup on port {} ({}), attempt {}/{}",
                        port, status, attempt, attempts
                    );
                    server.shutdown().await;
                }
            }
        }

        Err(SetupError::ServerExited { attempts })
    }

    fn launch(config: &ServerConfig, port: u16) -> Result<Self, SetupError> {
        let args: Vec<String> = config
            .command
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect();

        info!("Spawning dev server on port {}: {}", port, args.join(" "));

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]).current_dir(&config.dir).stdin(Stdio::null());

        if !config.inherit_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // Own process group so stop() can reap whatever the server forks
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            SetupError::Spawn(format!(
                "failed to spawn {} in {}: {}",
                args[0],
                config.dir.display(),
                e
            ))
        })?;

        Ok(Self {
            child: Some(child),
            exited: None,
            base_url: format!("http://localhost:{}/", port),
            port,
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        })
    }

    async fn wait_ready(&mut self, readiness: &Readiness) -> Result<Startup, SetupError> {
        match *readiness {
            Readiness::Delay { ms } => {
                sleep(Duration::from_millis(ms)).await;
                Ok(match self.exit_status() {
                    Some(status) => Startup::Exited(status),
                    None => Startup::Ready,
                })
            }
            Readiness::Poll {
                timeout_ms,
                interval_ms,
            } => {
                let timeout = Duration::from_millis(timeout_ms);
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(2))
                    .build()?;

                let start = Instant::now();
                let mut attempts = 0;

                while start.elapsed() < timeout {
                    attempts += 1;

                    if let Some(status) = self.exit_status() {
                        return Ok(Startup::Exited(status));
                    }

                    match client.get(&self.base_url).send().await {
                        Ok(resp) if resp.status().is_success() => return Ok(Startup::Ready),
                        Ok(resp) => {
                            debug!("Readiness check returned {}", resp.status());
                        }
                        Err(e) => {
                            if attempts == 1 {
                                info!("Waiting for dev server to start...");
                            }
                            // Refused connections are expected while starting
                            if !e.is_connect() {
                                warn!("Readiness check error: {}", e);
                            }
                        }
                    }

                    sleep(Duration::from_millis(interval_ms)).await;
                }

                Err(SetupError::NotReady {
                    url: self.base_url.clone(),
                    waited: start.elapsed(),
                })
            }
        }
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.exited.is_none() {
            self.exited = self
                .child
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten());
        }
        self.exited
    }

    /// Whether the process group may still be signalled.
    ///
    /// After the leader has been reaped its pid can belong to an unrelated
    /// process, so a server whose exit was observed is never signalled.
    fn owns_process_group(&self) -> bool {
        self.child.is_some() && self.exited.is_none()
    }

    /// Base URL of the embedding page, `http://localhost:<port>/`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pid of the server process while it is supervised
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Terminate the server and its process group.
    ///
    /// Sends SIGTERM, waits at most the configured grace period, then
    /// SIGKILLs. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        let Some(signal_group) = self.begin_stop() else {
            return;
        };

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline && self.leader_running() {
            sleep(STOP_POLL_INTERVAL).await;
        }

        self.finish_stop(signal_group);
    }

    /// Blocking variant of [`DevServer::shutdown`], used on drop
    pub fn stop(&mut self) {
        let Some(signal_group) = self.begin_stop() else {
            return;
        };

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline && self.leader_running() {
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        self.finish_stop(signal_group);
    }

    /// SIGTERM the group. Returns whether the group may be signalled, or
    /// None when there is nothing left to stop.
    fn begin_stop(&mut self) -> Option<bool> {
        let child = self.child.as_ref()?;
        info!("Stopping dev server (pid: {})", child.id());

        let signal_group = self.owns_process_group();
        if signal_group {
            self.signal_group(Signal::SIGTERM);
        } else {
            debug!("Dev server already exited, not signalling its group");
        }
        Some(signal_group)
    }

    fn leader_running(&mut self) -> bool {
        match self.child.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_)) | Err(_)) | None => false,
        }
    }

    fn finish_stop(&mut self, signal_group: bool) {
        // Leftover group members, or a leader that ignored SIGTERM
        if signal_group {
            self.signal_group(Signal::SIGKILL);
        }

        let Some(mut child) = self.child.take() else {
            return;
        };

        let _ = child.kill();
        match child.wait() {
            Ok(status) => debug!("Dev server exited with {}", status),
            Err(e) => warn!("Failed to reap dev server: {}", e),
        }
    }

    fn signal_group(&self, signal: Signal) {
        let Some(child) = &self.child else {
            return;
        };
        let group = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(group, signal) {
            debug!("{:?} to process group {} failed: {}", signal, group, e);
        }
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the dependency preparation step unless its marker already exists
async fn prepare(config: &ServerConfig) -> Result<(), SetupError> {
    let Some((program, args)) = config.prepare.split_first() else {
        return Ok(());
    };

    if let Some(marker) = &config.prepare_marker {
        let marker = config.dir.join(marker);
        if marker.exists() {
            debug!(
                "Skipping dependency preparation, {} exists",
                marker.display()
            );
            return Ok(());
        }
    }

    let command = config.prepare.join(" ");
    info!("Preparing dev server dependencies: {}", command);

    let status = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&config.dir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| SetupError::Prepare {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !status.success() {
        return Err(SetupError::Prepare {
            command,
            reason: format!("exited with {}", status),
        });
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::wait_until_gone;
    use nix::sys::signal::kill;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_in(dir: &std::path::Path, command: &[&str]) -> ServerConfig {
        ServerConfig {
            dir: dir.to_path_buf(),
            prepare: Vec::new(),
            prepare_marker: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            readiness: Readiness::Delay { ms: 0 },
            stop_grace_ms: 500,
            ..Default::default()
        }
    }

    fn is_alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_prepare_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            prepare: vec!["false".to_string()],
            ..config_in(dir.path(), &["sleep", "30"])
        };

        let err = DevServer::start(&config).await.err().unwrap();
        assert!(matches!(err, SetupError::Prepare { .. }));
    }

    #[tokio::test]
    async fn test_prepare_skipped_when_marker_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        let config = ServerConfig {
            prepare: vec!["false".to_string()],
            prepare_marker: Some(PathBuf::from("node_modules")),
            ..config_in(dir.path(), &["sleep", "30"])
        };

        let mut server = DevServer::start(&config).await.unwrap();
        assert_eq!(
            server.base_url(),
            format!("http://localhost:{}/", server.port())
        );
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = DevServer::start(&config_in(dir.path(), &["sleep", "30"]))
            .await
            .unwrap();
        let pid = server.pid().unwrap();
        assert!(is_alive(pid));

        server.stop();
        assert!(!is_alive(pid));
        assert!(server.pid().is_none());

        // Idempotent
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            stop_grace_ms: 100,
            ..config_in(dir.path(), &["sh", "-c", "trap '' TERM; sleep 30"])
        };
        let mut server = DevServer::start(&config).await.unwrap();
        let pid = server.pid().unwrap();

        let start = Instant::now();
        server.stop();
        assert!(!is_alive(pid));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drop_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let server = DevServer::start(&config_in(dir.path(), &["sleep", "30"]))
            .await
            .unwrap();
        let pid = server.pid().unwrap();
        drop(server);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = DevServer::start(&config_in(
            dir.path(),
            &["sh", "-c", "sleep 30 & echo $! > worker.pid; wait"],
        ))
        .await
        .unwrap();
        let pid = server.pid().unwrap();

        let path = dir.path().join("worker.pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut written = String::new();
        while !written.ends_with('\n') && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
            written = std::fs::read_to_string(&path).unwrap_or_default();
        }
        let worker: i32 = written.trim().parse().unwrap();

        server.shutdown().await;
        assert!(!is_alive(pid));
        assert!(wait_until_gone(worker, Duration::from_secs(5)));
        assert!(server.pid().is_none());

        // Idempotent, in either flavour
        server.shutdown().await;
        server.stop();
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            stop_grace_ms: 100,
            ..config_in(dir.path(), &["sh", "-c", "trap '' TERM; sleep 30"])
        };
        let mut server = DevServer::start(&config).await.unwrap();
        let pid = server.pid().unwrap();

        let start = Instant::now();
        server.shutdown().await;
        assert!(!is_alive(pid));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_observed_exit_releases_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = DevServer::launch(&config_in(dir.path(), &["true"]), 45_124).unwrap();
        assert!(server.owns_process_group());

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.exit_status().is_none() && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        assert!(server.exit_status().unwrap().success());

        // The reaped leader's pid may already belong to someone else
        assert!(!server.owns_process_group());
        server.shutdown().await;
        assert!(server.pid().is_none());
    }

    #[tokio::test]
    async fn test_server_exiting_during_startup_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            readiness: Readiness::Poll {
                timeout_ms: 5_000,
                interval_ms: 20,
            },
            launch_attempts: 2,
            ..config_in(dir.path(), &["true"])
        };

        let err = DevServer::start(&config).await.err().unwrap();
        assert!(matches!(err, SetupError::ServerExited { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            readiness: Readiness::Poll {
                timeout_ms: 300,
                interval_ms: 20,
            },
            ..config_in(dir.path(), &["sleep", "30"])
        };

        let err = DevServer::start(&config).await.err().unwrap();
        assert!(matches!(err, SetupError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_readiness_poll_succeeds_against_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            port: Some(port),
            readiness: Readiness::Poll {
                timeout_ms: 5_000,
                interval_ms: 20,
            },
            ..config_in(dir.path(), &["sleep", "30"])
        };

        let server = DevServer::start(&config).await.unwrap();
        assert_eq!(server.port(), port);
    }

    #[tokio::test]
    async fn test_port_placeholder_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            port: Some(45_123),
            ..config_in(
                dir.path(),
                &["sh", "-c", "echo $0 > port.txt; sleep 30", PORT_PLACEHOLDER],
            )
        };

        let server = DevServer::start(&config).await.unwrap();
        let path = dir.path().join("port.txt");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut written = String::new();
        while !written.ends_with('\n') && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
            written = std::fs::read_to_string(&path).unwrap_or_default();
        }
        drop(server);
        assert_eq!(written.trim(), "45123");
    }
}
