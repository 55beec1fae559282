//! Lifecycle of the managed PostgreSQL server: init, start, readiness, stop.

use crate::config::{Config, Secret};
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::ffi::OsString;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Process name matched by `stop_any`.
pub const SERVER_PROCESS_NAME: &str = "postgres";

/// Database used by the readiness probe; always present after initdb.
const PROBE_DATABASE: &str = "postgres";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;

/// Where a managed server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    /// Failed readiness or failed shutdown. Only a stop attempt can follow.
    Unhealthy,
}

impl ServerState {
    fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Unhealthy)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Unhealthy, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Unhealthy)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
            ServerState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// One server instance bound to a data directory.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    data_dir: PathBuf,
    log_path: PathBuf,
    state: ServerState,
}

impl ServerHandle {
    pub fn new(data_dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            log_path: log_path.into(),
            state: ServerState::Stopped,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ServerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(HarnessError::InvalidState(format!(
                "server on {} cannot go from {} to {}",
                self.data_dir.display(),
                self.state,
                next
            )));
        }
        debug!("server {}: {} -> {}", self.data_dir.display(), self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Result of `stop_any`. Finding nothing to stop is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAnyOutcome {
    Terminated,
    NothingRunning,
}

/// Bounded fixed-interval polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl ReadinessPolicy {
    /// Hard budget for one `await_ready` call. Saturates instead of overflowing.
    pub fn timeout(&self) -> Duration {
        self.interval
            .checked_mul(self.attempts.max(1))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::DEFAULT_READY_ATTEMPTS,
            interval: crate::config::DEFAULT_READY_INTERVAL,
        }
    }
}

/// A lightweight check that the server accepts work.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> bool;

    /// Endpoint description for messages.
    fn describe(&self) -> String;
}

/// Accepts as soon as the port takes a TCP connection.
pub struct TcpProbe {
    host: String,
    port: u16,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn check(&self) -> bool {
        check_port(&self.host, self.port).await
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TCP accept followed by `SELECT 1` on the maintenance database.
pub struct PgReadinessProbe {
    host: String,
    port: u16,
    user: String,
    password: Secret,
}

impl PgReadinessProbe {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: Secret) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password,
        }
    }

    async fn select_one(&self) -> bool {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(PROBE_DATABASE)
            .disable_statement_logging();
        if !self.password.is_empty() {
            options = options.password(self.password.expose());
        }

        let attempt = async {
            let mut conn = sqlx::PgConnection::connect_with(&options).await?;
            sqlx::query("SELECT 1").execute(&mut conn).await?;
            conn.close().await
        };

        match timeout(PROBE_TIMEOUT, attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("readiness query failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ReadinessProbe for PgReadinessProbe {
    async fn check(&self) -> bool {
        check_port(&self.host, self.port).await && self.select_one().await
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

async fn check_port(host: &str, port: u16) -> bool {
    let addr = format!("{}:{}", host, port);
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await, Ok(Ok(_)))
}

/// Poll `probe` until it passes or the policy is exhausted.
///
/// The policy's `timeout()` is a hard deadline: a slow or hung check is cut
/// off when it expires, and the wait between checks never runs past it.
/// Returns the attempt number that succeeded. On expiry the error is
/// `Timeout` carrying the number of checks made; the server is left as it is.
pub async fn await_ready(probe: &dyn ReadinessProbe, policy: &ReadinessPolicy) -> Result<u32> {
    let started = Instant::now();
    let deadline = started.checked_add(policy.timeout());
    let attempts = policy.attempts.max(1);
    let mut made = 0;

    for attempt in 1..=attempts {
        let left = time_left(deadline);
        if attempt > 1 && left.is_zero() {
            break;
        }
        made = attempt;
        if timeout(left, probe.check()).await.unwrap_or(false) {
            debug!(
                "{} ready on attempt {} after {:?}",
                probe.describe(),
                attempt,
                started.elapsed()
            );
            return Ok(attempt);
        }

        let left = time_left(deadline);
        if left.is_zero() {
            break;
        }
        sleep(policy.interval.min(left)).await;
    }

    Err(HarnessError::Timeout {
        endpoint: probe.describe(),
        attempts: made,
        waited: started.elapsed(),
    })
}

fn time_left(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => Duration::MAX,
    }
}

/// Server lifecycle operations used by the workflows.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Terminate any running instance of the server, whoever started it.
    async fn stop_any(&self) -> Result<StopAnyOutcome>;

    /// Create a fresh, tuned cluster in `data_dir`. Existing contents are removed.
    async fn init(&self, data_dir: &Path) -> Result<()>;

    /// Launch the server without waiting for it to accept connections.
    async fn start(&self, data_dir: &Path, log_path: &Path) -> Result<ServerHandle>;

    /// Block until the server passes its readiness probe.
    async fn await_ready(&self, handle: &mut ServerHandle) -> Result<()>;

    /// Graceful shutdown; waits for exit up to the configured grace period.
    async fn stop(&self, handle: &mut ServerHandle) -> Result<()>;
}

/// `ServerControl` backed by `initdb`, `pg_ctl`, `pkill` and `pgrep`.
pub struct ProcessController {
    pg_bin_dir: PathBuf,
    pg_lib_dir: Option<PathBuf>,
    host: String,
    port: u16,
    user: String,
    password: Secret,
    readiness: ReadinessPolicy,
    stop_timeout: Duration,
    settings: Vec<(String, String)>,
}

impl ProcessController {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pg_bin_dir: config.pg_bin_dir.clone(),
            pg_lib_dir: config.pg_lib_dir.clone(),
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            readiness: ReadinessPolicy {
                attempts: config.ready_attempts,
                interval: config.ready_interval,
            },
            stop_timeout: config.stop_timeout,
            settings: tuned_settings(config),
        }
    }

    fn pg_command(&self, tool: &str) -> Command {
        let mut cmd = Command::new(self.pg_bin_dir.join(tool));
        if let Some(lib) = &self.pg_lib_dir {
            cmd.env("LD_LIBRARY_PATH", library_path(lib));
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Whether a server is running on `data_dir`, per `pg_ctl status`.
    pub async fn is_running(&self, data_dir: &Path) -> Result<bool> {
        let output = self
            .pg_command("pg_ctl")
            .arg("status")
            .arg("-D")
            .arg(data_dir)
            .output()
            .await
            .map_err(|e| spawn_error("pg_ctl", e))?;
        // 0 running, 3 not running, 4 no usable data directory
        match output.status.code() {
            Some(0) => Ok(true),
            Some(3) | Some(4) => Ok(false),
            _ => Err(command_error("pg_ctl status", &output)),
        }
    }

    async fn any_server_process(&self) -> Result<bool> {
        let output = Command::new("pgrep")
            .args(["-x", SERVER_PROCESS_NAME])
            .output()
            .await
            .map_err(|e| spawn_error("pgrep", e))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error("pgrep", &output)),
        }
    }

    fn append_settings(&self, data_dir: &Path) -> Result<()> {
        let conf = data_dir.join("postgresql.conf");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&conf)
            .map_err(|e| HarnessError::io(&conf, e))?;
        file.write_all(render_settings(&self.settings).as_bytes())
            .map_err(|e| HarnessError::io(&conf, e))
    }
}

#[async_trait]
impl ServerControl for ProcessController {
    async fn stop_any(&self) -> Result<StopAnyOutcome> {
        let output = Command::new("pkill")
            .args(["-INT", "-x", SERVER_PROCESS_NAME])
            .output()
            .await
            .map_err(|e| spawn_error("pkill", e))?;

        match output.status.code() {
            Some(1) => {
                debug!("no {} process running", SERVER_PROCESS_NAME);
                return Ok(StopAnyOutcome::NothingRunning);
            }
            Some(0) => {}
            _ => return Err(command_error("pkill", &output)),
        }

        info!("Signalled running {} processes, waiting for exit", SERVER_PROCESS_NAME);
        let deadline = Instant::now().checked_add(self.stop_timeout);
        while self.any_server_process().await? {
            if time_left(deadline).is_zero() {
                return Err(HarnessError::StopFailed {
                    data_dir: PathBuf::from("<any>"),
                    detail: format!(
                        "{} processes still running after {:?}",
                        SERVER_PROCESS_NAME, self.stop_timeout
                    ),
                });
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(StopAnyOutcome::Terminated)
    }

    async fn init(&self, data_dir: &Path) -> Result<()> {
        if data_dir.exists() {
            warn!("Removing existing data directory {}", data_dir.display());
            tokio::fs::remove_dir_all(data_dir)
                .await
                .map_err(|e| HarnessError::io(data_dir, e))?;
        }
        if let Some(parent) = data_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
        }

        info!("Initializing cluster in {}", data_dir.display());
        let output = self
            .pg_command("initdb")
            .arg("-D")
            .arg(data_dir)
            .arg("-U")
            .arg(&self.user)
            .args(["--auth=trust", "-E", "UTF8"])
            .output()
            .await
            .map_err(|e| spawn_error("initdb", e))?;
        if !output.status.success() {
            return Err(command_error("initdb", &output));
        }

        self.append_settings(data_dir)
    }

    async fn start(&self, data_dir: &Path, log_path: &Path) -> Result<ServerHandle> {
        let mut handle = ServerHandle::new(data_dir, log_path);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
        }

        info!(
            "Starting server on port {} (data {}, log {})",
            self.port,
            data_dir.display(),
            log_path.display()
        );
        let output = self
            .pg_command("pg_ctl")
            .arg("-D")
            .arg(data_dir)
            .arg("-l")
            .arg(log_path)
            .arg("-o")
            .arg(format!("-p {}", self.port))
            .args(["-W", "start"])
            .output()
            .await
            .map_err(|e| spawn_error("pg_ctl", e))?;
        if !output.status.success() {
            return Err(command_error("pg_ctl start", &output));
        }

        handle.transition(ServerState::Starting)?;
        Ok(handle)
    }

    async fn await_ready(&self, handle: &mut ServerHandle) -> Result<()> {
        if handle.state() != ServerState::Starting {
            return Err(HarnessError::InvalidState(format!(
                "await_ready needs a starting server, found {}",
                handle.state()
            )));
        }

        let probe = PgReadinessProbe::new(&self.host, self.port, &self.user, self.password.clone());
        info!(
            "Waiting for {} (up to {} x {:?})",
            probe.describe(),
            self.readiness.attempts,
            self.readiness.interval
        );
        match await_ready(&probe, &self.readiness).await {
            Ok(attempt) => {
                info!("Server ready after {} attempt(s)", attempt);
                handle.transition(ServerState::Ready)
            }
            Err(e) => {
                handle.transition(ServerState::Unhealthy)?;
                Err(e)
            }
        }
    }

    async fn stop(&self, handle: &mut ServerHandle) -> Result<()> {
        handle.transition(ServerState::Stopping)?;
        info!("Stopping server on {}", handle.data_dir().display());

        let output = self
            .pg_command("pg_ctl")
            .arg("-D")
            .arg(handle.data_dir())
            .args(["-m", "fast", "-w", "-t"])
            .arg(self.stop_timeout.as_secs().max(1).to_string())
            .arg("stop")
            .output()
            .await;

        let failure = match output {
            Ok(out) if out.status.success() => None,
            Ok(out) => Some(describe_failure(&out)),
            Err(e) => Some(format!("could not run pg_ctl: {}", e)),
        };

        match failure {
            None => handle.transition(ServerState::Stopped),
            Some(detail) => {
                handle.transition(ServerState::Unhealthy)?;
                Err(HarnessError::StopFailed {
                    data_dir: handle.data_dir().to_path_buf(),
                    detail,
                })
            }
        }
    }
}

/// Server settings appended to `postgresql.conf`, sized from the memory target.
pub fn tuned_settings(config: &Config) -> Vec<(String, String)> {
    let target = config.target_memory_gb;
    let shared_buffers = (target / 4.0).floor().max(1.0) as u64;
    let effective_cache = (target * 0.75).floor().max(1.0) as u64;
    let listen = if config.host == "localhost" || config.host == "127.0.0.1" {
        "localhost"
    } else {
        "*"
    };

    let mut settings: Vec<(String, String)> = vec![
        ("port".into(), config.port.to_string()),
        ("listen_addresses".into(), listen.into()),
        ("shared_buffers".into(), format!("{}GB", shared_buffers)),
        ("effective_cache_size".into(), format!("{}GB", effective_cache)),
        ("work_mem".into(), "256MB".into()),
        ("maintenance_work_mem".into(), "2GB".into()),
        ("max_wal_size".into(), "16GB".into()),
        ("checkpoint_timeout".into(), "30min".into()),
        ("max_parallel_workers_per_gather".into(), "4".into()),
        ("synchronous_commit".into(), "off".into()),
    ];

    for (key, value) in &config.server_settings {
        match settings.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => settings.push((key.clone(), value.clone())),
        }
    }
    settings
}

fn render_settings(settings: &[(String, String)]) -> String {
    let mut block = String::from("\n# tpch-harness tuning\n");
    for (key, value) in settings {
        block.push_str(&format!("{} = '{}'\n", key, value.replace('\'', "''")));
    }
    block
}

fn library_path(lib: &Path) -> OsString {
    let mut value = lib.as_os_str().to_os_string();
    if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
        if !existing.is_empty() {
            value.push(":");
            value.push(existing);
        }
    }
    value
}

pub(crate) fn spawn_error(program: &str, err: std::io::Error) -> HarnessError {
    HarnessError::Command {
        program: program.to_string(),
        detail: format!("could not start: {}", err),
    }
}

pub(crate) fn command_error(program: &str, output: &Output) -> HarnessError {
    HarnessError::Command {
        program: program.to_string(),
        detail: describe_failure(output),
    }
}

fn describe_failure(output: &Output) -> String {
    let status = match output.status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    };
    let tail = stderr_tail(&output.stderr, STDERR_TAIL_LINES);
    if tail.is_empty() {
        status
    } else {
        format!("{}: {}", status, tail)
    }
}

/// Last `lines` non-empty lines of a process's stderr.
pub(crate) fn stderr_tail(stderr: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let kept: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ReadyAfter {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReadinessProbe for ReadyAfter {
        async fn check(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.failures
        }

        fn describe(&self) -> String {
            "fake:1".to_string()
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut handle = ServerHandle::new("/pg", "/pg.log");
        assert_eq!(handle.state(), ServerState::Stopped);
        handle.transition(ServerState::Starting).unwrap();
        handle.transition(ServerState::Ready).unwrap();
        handle.transition(ServerState::Stopping).unwrap();
        handle.transition(ServerState::Stopped).unwrap();
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut handle = ServerHandle::new("/pg", "/pg.log");
        let err = handle.transition(ServerState::Ready).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState(_)));
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[test]
    fn test_unhealthy_can_only_be_stopped() {
        let mut handle = ServerHandle::new("/pg", "/pg.log");
        handle.transition(ServerState::Starting).unwrap();
        handle.transition(ServerState::Unhealthy).unwrap();
        assert!(handle.transition(ServerState::Ready).is_err());
        handle.transition(ServerState::Stopping).unwrap();
    }

    #[test]
    fn test_default_policy_budget() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.attempts, 30);
        assert_eq!(policy.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_policy_budget_saturates() {
        let policy = ReadinessPolicy {
            attempts: u32::MAX,
            interval: Duration::MAX,
        };
        assert_eq!(policy.timeout(), Duration::MAX);
        assert_eq!(time_left(None), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_succeeds_on_later_attempt() {
        let probe = ReadyAfter {
            failures: 4,
            calls: AtomicU32::new(0),
        };
        let attempt = await_ready(&probe, &ReadinessPolicy::default()).await.unwrap();
        assert_eq!(attempt, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_times_out() {
        let probe = ReadyAfter {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = await_ready(&probe, &ReadinessPolicy::default()).await.unwrap_err();
        match err {
            HarnessError::Timeout {
                attempts, waited, ..
            } => {
                assert_eq!(attempts, 30);
                assert_eq!(waited, Duration::from_secs(30));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn test_render_settings_quotes_values() {
        let block = render_settings(&[
            ("work_mem".into(), "256MB".into()),
            ("application_name".into(), "it's".into()),
        ]);
        assert!(block.contains("work_mem = '256MB'\n"));
        assert!(block.contains("application_name = 'it''s'\n"));
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = stderr_tail(b"one\n\ntwo\nthree\n", 2);
        assert_eq!(tail, "two\nthree");
    }
}
