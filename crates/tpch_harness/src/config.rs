//! Layered configuration: built-in defaults, then environment, then CLI flags.
//!
//! Each source is first turned into a [`ConfigLayer`] (every field optional),
//! the layers are overlaid in precedence order, and the result is validated
//! into one immutable [`Config`]. Nothing in the harness reads the process
//! environment after [`resolve`] returns.

use crate::error::{HarnessError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "tpch";
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_SCALE_FACTOR: f64 = 1.0;
pub const DEFAULT_TARGET_MEMORY_GB: f64 = 128.0;
pub const DEFAULT_WARMUP_ROUNDS: u32 = 3;
pub const DEFAULT_READY_ATTEMPTS: u32 = 30;
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for the stop grace period and the readiness budget.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Environment variables understood by [`ConfigLayer::from_env`].
pub mod env_keys {
    pub const HOST: &str = "PGHOST";
    pub const PORT: &str = "PGPORT";
    pub const DATABASE: &str = "PGDATABASE";
    pub const USER: &str = "PGUSER";
    pub const PASSWORD: &str = "PGPASSWORD";
    pub const DATA_DIR: &str = "PGDATA";
    pub const PG_BIN: &str = "TPCH_PG_BIN";
    pub const PG_LIB: &str = "TPCH_PG_LIB";
    pub const CHECKPOINT_DIR: &str = "TPCH_CHECKPOINT_DIR";
    pub const QUERY_DIR: &str = "TPCH_QUERY_DIR";
    pub const RESULTS_DIR: &str = "TPCH_RESULTS_DIR";
    pub const DBGEN_DIR: &str = "TPCH_DBGEN_DIR";
    pub const SERVER_LOG: &str = "TPCH_SERVER_LOG";
    pub const QUERIES: &str = "TPCH_QUERIES";
    pub const RUN_ID: &str = "TPCH_RUN_ID";
    pub const WARMUP_ITERATIONS: &str = "TPCH_WARMUP_ITERATIONS";
    pub const SKIP_WARMUP: &str = "TPCH_SKIP_WARMUP";
    pub const SCALE_FACTOR: &str = "TPCH_SCALE_FACTOR";
    pub const TARGET_MEMORY_GB: &str = "TPCH_TARGET_MEMORY_GB";
    pub const WARMUP_ROUNDS: &str = "TPCH_WARMUP_ROUNDS";
    pub const WARMUP_QUERIES: &str = "TPCH_WARMUP_QUERIES";
    pub const READY_ATTEMPTS: &str = "TPCH_READY_ATTEMPTS";
    pub const READY_INTERVAL_MS: &str = "TPCH_READY_INTERVAL_MS";
    pub const STOP_TIMEOUT_SECS: &str = "TPCH_STOP_TIMEOUT_SECS";

    pub const ALL: &[&str] = &[
        HOST,
        PORT,
        DATABASE,
        USER,
        PASSWORD,
        DATA_DIR,
        PG_BIN,
        PG_LIB,
        CHECKPOINT_DIR,
        QUERY_DIR,
        RESULTS_DIR,
        DBGEN_DIR,
        SERVER_LOG,
        QUERIES,
        RUN_ID,
        WARMUP_ITERATIONS,
        SKIP_WARMUP,
        SCALE_FACTOR,
        TARGET_MEMORY_GB,
        WARMUP_ROUNDS,
        WARMUP_QUERIES,
        READY_ATTEMPTS,
        READY_INTERVAL_MS,
        STOP_TIMEOUT_SECS,
    ];
}

/// A credential. Never printed, never serialized.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a client library or child environment.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Which workload items to run. An empty list on the command line means all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadSelection {
    All,
    Items(Vec<String>),
}

impl WorkloadSelection {
    /// Parse a comma-separated identifier list (`"1,6"`). Empty or `all` selects everything.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let mut items: Vec<String> = Vec::new();
        for part in trimmed.split(',') {
            let id = part.trim();
            if id.is_empty() {
                return Err(format!("empty identifier in '{}'", raw));
            }
            if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
                return Err(format!("'{}' is not a valid workload identifier", id));
            }
            if !items.iter().any(|existing| existing == id) {
                items.push(id.to_string());
            }
        }
        Ok(Self::Items(items))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for WorkloadSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Items(items) => f.write_str(&items.join(",")),
        }
    }
}

/// Unmeasured passes of each item before its measured pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupPasses {
    Skip,
    Iterations(u32),
}

impl WarmupPasses {
    pub fn count(&self) -> u32 {
        match self {
            Self::Skip => 0,
            Self::Iterations(n) => *n,
        }
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pg_bin_dir: PathBuf,
    pub pg_lib_dir: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub query_dir: PathBuf,
    pub results_dir: PathBuf,
    pub dbgen_dir: PathBuf,
    pub server_log: PathBuf,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub queries: WorkloadSelection,
    pub run_id: String,
    pub warmup: WarmupPasses,
    pub scale_factor: f64,
    pub target_memory_gb: f64,
    pub warmup_rounds: u32,
    pub warmup_queries: WorkloadSelection,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub stop_timeout: Duration,
    pub regenerate: bool,
    pub before_sql: Vec<String>,
    pub after_sql: Vec<String>,
    pub server_settings: Vec<(String, String)>,
}

impl Config {
    /// `host:port/database`, for messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Where a benchmark result for this run is written.
    pub fn result_path(&self) -> PathBuf {
        self.results_dir.join(format!("{}.json", self.run_id))
    }

    /// Where the setup warmup result is written.
    pub fn warmup_result_path(&self) -> PathBuf {
        self.results_dir.join(format!("{}-warmup.json", self.run_id))
    }
}

/// Everything `resolve` needs from the outside world, captured once.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub now: DateTime<Utc>,
    /// `pg_ctl` as found on `PATH`, if any.
    pub pg_ctl_on_path: Option<PathBuf>,
}

impl ResolveContext {
    /// Capture the current process state.
    pub fn current(home: PathBuf) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| HarnessError::io(".", e))?;
        Ok(Self {
            cwd,
            home,
            now: Utc::now(),
            pg_ctl_on_path: which::which("pg_ctl").ok(),
        })
    }
}

/// Snapshot of the harness-relevant environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot(BTreeMap<String, String>);

impl EnvSnapshot {
    /// Read the known keys from the process environment.
    pub fn from_process() -> Self {
        Self(
            env_keys::ALL
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
                .collect(),
        )
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// One configuration source. `None` means "this source says nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    pub pg_bin_dir: Option<PathBuf>,
    pub pg_lib_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub query_dir: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
    pub dbgen_dir: Option<PathBuf>,
    pub server_log: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<Secret>,
    pub queries: Option<WorkloadSelection>,
    pub run_id: Option<String>,
    pub warmup: Option<WarmupPasses>,
    pub scale_factor: Option<f64>,
    pub target_memory_gb: Option<f64>,
    pub warmup_rounds: Option<u32>,
    pub warmup_queries: Option<WorkloadSelection>,
    pub ready_attempts: Option<u32>,
    pub ready_interval: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub regenerate: Option<bool>,
    pub before_sql: Option<Vec<String>>,
    pub after_sql: Option<Vec<String>>,
    pub server_settings: Option<Vec<(String, String)>>,
}

impl ConfigLayer {
    /// Built-in defaults. Paths live under the harness home or the working directory.
    pub fn defaults(ctx: &ResolveContext) -> Self {
        Self {
            pg_bin_dir: ctx
                .pg_ctl_on_path
                .as_ref()
                .and_then(|p| p.parent().map(Path::to_path_buf)),
            pg_lib_dir: None,
            data_dir: Some(ctx.home.join("pgdata")),
            checkpoint_dir: Some(ctx.home.join("checkpoint")),
            query_dir: Some(ctx.cwd.join("queries")),
            results_dir: Some(ctx.home.join("results")),
            dbgen_dir: Some(ctx.cwd.join("tpch-dbgen")),
            server_log: Some(ctx.home.join("logs").join("postgres.log")),
            host: Some(DEFAULT_HOST.to_string()),
            port: Some(DEFAULT_PORT),
            database: Some(DEFAULT_DATABASE.to_string()),
            user: Some(DEFAULT_USER.to_string()),
            password: Some(Secret::default()),
            queries: Some(WorkloadSelection::All),
            run_id: Some(format!("run-{}", ctx.now.format("%Y%m%d-%H%M%S"))),
            warmup: Some(WarmupPasses::Iterations(0)),
            scale_factor: Some(DEFAULT_SCALE_FACTOR),
            target_memory_gb: Some(DEFAULT_TARGET_MEMORY_GB),
            warmup_rounds: Some(DEFAULT_WARMUP_ROUNDS),
            warmup_queries: Some(WorkloadSelection::All),
            ready_attempts: Some(DEFAULT_READY_ATTEMPTS),
            ready_interval: Some(DEFAULT_READY_INTERVAL),
            stop_timeout: Some(DEFAULT_STOP_TIMEOUT),
            regenerate: Some(false),
            before_sql: Some(Vec::new()),
            after_sql: Some(Vec::new()),
            server_settings: Some(Vec::new()),
        }
    }

    /// Parse the environment. Unparsable values are errors, not silently ignored.
    pub fn from_env(env: &EnvSnapshot) -> Result<Self> {
        use env_keys as k;

        let iterations: Option<u32> = parse_env(env, k::WARMUP_ITERATIONS)?;
        let skip = match env.get(k::SKIP_WARMUP) {
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                HarnessError::invalid_config(format!(
                    "{}='{}' is not a boolean (use 1/0, true/false, yes/no)",
                    k::SKIP_WARMUP,
                    raw
                ))
            })?,
            None => false,
        };
        let warmup = warmup_choice(iterations, skip, k::WARMUP_ITERATIONS, k::SKIP_WARMUP)?;

        Ok(Self {
            pg_bin_dir: env.get(k::PG_BIN).map(PathBuf::from),
            pg_lib_dir: env.get(k::PG_LIB).map(PathBuf::from),
            data_dir: env.get(k::DATA_DIR).map(PathBuf::from),
            checkpoint_dir: env.get(k::CHECKPOINT_DIR).map(PathBuf::from),
            query_dir: env.get(k::QUERY_DIR).map(PathBuf::from),
            results_dir: env.get(k::RESULTS_DIR).map(PathBuf::from),
            dbgen_dir: env.get(k::DBGEN_DIR).map(PathBuf::from),
            server_log: env.get(k::SERVER_LOG).map(PathBuf::from),
            host: env.get(k::HOST).map(str::to_string),
            port: parse_env(env, k::PORT)?,
            database: env.get(k::DATABASE).map(str::to_string),
            user: env.get(k::USER).map(str::to_string),
            password: env.get(k::PASSWORD).map(Secret::new),
            queries: parse_selection_env(env, k::QUERIES)?,
            run_id: env.get(k::RUN_ID).map(str::to_string),
            warmup,
            scale_factor: parse_env(env, k::SCALE_FACTOR)?,
            target_memory_gb: parse_env(env, k::TARGET_MEMORY_GB)?,
            warmup_rounds: parse_env(env, k::WARMUP_ROUNDS)?,
            warmup_queries: parse_selection_env(env, k::WARMUP_QUERIES)?,
            ready_attempts: parse_env(env, k::READY_ATTEMPTS)?,
            ready_interval: parse_env::<u64>(env, k::READY_INTERVAL_MS)?.map(Duration::from_millis),
            stop_timeout: parse_env::<u64>(env, k::STOP_TIMEOUT_SECS)?.map(Duration::from_secs),
            regenerate: None,
            before_sql: None,
            after_sql: None,
            server_settings: None,
        })
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            pg_bin_dir: self.pg_bin_dir.or(lower.pg_bin_dir),
            pg_lib_dir: self.pg_lib_dir.or(lower.pg_lib_dir),
            data_dir: self.data_dir.or(lower.data_dir),
            checkpoint_dir: self.checkpoint_dir.or(lower.checkpoint_dir),
            query_dir: self.query_dir.or(lower.query_dir),
            results_dir: self.results_dir.or(lower.results_dir),
            dbgen_dir: self.dbgen_dir.or(lower.dbgen_dir),
            server_log: self.server_log.or(lower.server_log),
            host: self.host.or(lower.host),
            port: self.port.or(lower.port),
            database: self.database.or(lower.database),
            user: self.user.or(lower.user),
            password: self.password.or(lower.password),
            queries: self.queries.or(lower.queries),
            run_id: self.run_id.or(lower.run_id),
            warmup: self.warmup.or(lower.warmup),
            scale_factor: self.scale_factor.or(lower.scale_factor),
            target_memory_gb: self.target_memory_gb.or(lower.target_memory_gb),
            warmup_rounds: self.warmup_rounds.or(lower.warmup_rounds),
            warmup_queries: self.warmup_queries.or(lower.warmup_queries),
            ready_attempts: self.ready_attempts.or(lower.ready_attempts),
            ready_interval: self.ready_interval.or(lower.ready_interval),
            stop_timeout: self.stop_timeout.or(lower.stop_timeout),
            regenerate: self.regenerate.or(lower.regenerate),
            before_sql: self.before_sql.or(lower.before_sql),
            after_sql: self.after_sql.or(lower.after_sql),
            server_settings: self.server_settings.or(lower.server_settings),
        }
    }
}

/// Combine one layer's warmup inputs. Both set in the same layer is an error.
pub fn warmup_choice(
    iterations: Option<u32>,
    skip: bool,
    iterations_name: &str,
    skip_name: &str,
) -> Result<Option<WarmupPasses>> {
    match (iterations, skip) {
        (Some(n), true) => Err(HarnessError::invalid_config(format!(
            "{} ({}) and {} are mutually exclusive",
            iterations_name, n, skip_name
        ))),
        (Some(n), false) => Ok(Some(WarmupPasses::Iterations(n))),
        (None, true) => Ok(Some(WarmupPasses::Skip)),
        (None, false) => Ok(None),
    }
}

/// Overlay `cli` over `env` over `defaults` and validate the result.
pub fn resolve(
    defaults: ConfigLayer,
    env: ConfigLayer,
    cli: ConfigLayer,
    ctx: &ResolveContext,
) -> Result<Config> {
    let merged = cli.or(env).or(defaults);

    let pg_bin_dir = merged.pg_bin_dir.ok_or_else(|| {
        HarnessError::invalid_config(format!(
            "server binary directory is not set and pg_ctl is not on PATH; pass --pg-bin or set {}",
            env_keys::PG_BIN
        ))
    })?;

    let config = Config {
        pg_bin_dir: required_path(Some(pg_bin_dir), "--pg-bin", ctx)?,
        pg_lib_dir: match merged.pg_lib_dir {
            Some(p) if p.as_os_str().is_empty() => None,
            Some(p) => Some(absolutize(&p, &ctx.cwd)),
            None => None,
        },
        data_dir: required_path(merged.data_dir, "--data-dir", ctx)?,
        checkpoint_dir: required_path(merged.checkpoint_dir, "--checkpoint-dir", ctx)?,
        query_dir: required_path(merged.query_dir, "--query-dir", ctx)?,
        results_dir: required_path(merged.results_dir, "--results-dir", ctx)?,
        dbgen_dir: required_path(merged.dbgen_dir, "--dbgen-dir", ctx)?,
        server_log: required_path(merged.server_log, "--server-log", ctx)?,
        host: required_text(merged.host, "--host")?,
        port: merged.port.unwrap_or(DEFAULT_PORT),
        database: required_text(merged.database, "--dbname")?,
        user: required_text(merged.user, "--user")?,
        password: merged.password.unwrap_or_default(),
        queries: merged.queries.unwrap_or(WorkloadSelection::All),
        run_id: required_text(merged.run_id, "--run-id")?,
        warmup: merged.warmup.unwrap_or(WarmupPasses::Iterations(0)),
        scale_factor: merged.scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR),
        target_memory_gb: merged.target_memory_gb.unwrap_or(DEFAULT_TARGET_MEMORY_GB),
        warmup_rounds: merged.warmup_rounds.unwrap_or(DEFAULT_WARMUP_ROUNDS),
        warmup_queries: merged.warmup_queries.unwrap_or(WorkloadSelection::All),
        ready_attempts: merged.ready_attempts.unwrap_or(DEFAULT_READY_ATTEMPTS),
        ready_interval: merged.ready_interval.unwrap_or(DEFAULT_READY_INTERVAL),
        stop_timeout: merged.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
        regenerate: merged.regenerate.unwrap_or(false),
        before_sql: merged.before_sql.unwrap_or_default(),
        after_sql: merged.after_sql.unwrap_or_default(),
        server_settings: merged.server_settings.unwrap_or_default(),
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.port == 0 {
        return Err(HarnessError::invalid_config("--port must be between 1 and 65535"));
    }
    if !(config.scale_factor.is_finite() && config.scale_factor > 0.0) {
        return Err(HarnessError::invalid_config(format!(
            "--scale-factor must be positive, got {}",
            config.scale_factor
        )));
    }
    if !(config.target_memory_gb.is_finite() && config.target_memory_gb > 0.0) {
        return Err(HarnessError::invalid_config(format!(
            "--target-memory must be positive, got {}",
            config.target_memory_gb
        )));
    }
    if config.warmup_rounds == 0 {
        return Err(HarnessError::invalid_config("--warmup-rounds must be at least 1"));
    }
    if config.ready_attempts == 0 {
        return Err(HarnessError::invalid_config("--ready-attempts must be at least 1"));
    }
    if config.ready_interval.is_zero() {
        return Err(HarnessError::invalid_config("--ready-interval-ms must be positive"));
    }
    let ready_budget = config.ready_interval.checked_mul(config.ready_attempts);
    if ready_budget.map_or(true, |budget| budget > MAX_WAIT) {
        return Err(HarnessError::invalid_config(format!(
            "--ready-attempts x --ready-interval-ms must not exceed {}s",
            MAX_WAIT.as_secs()
        )));
    }
    if config.stop_timeout > MAX_WAIT {
        return Err(HarnessError::invalid_config(format!(
            "--stop-timeout-secs must not exceed {}, got {}",
            MAX_WAIT.as_secs(),
            config.stop_timeout.as_secs()
        )));
    }
    if config.run_id.contains('/') || config.run_id.contains('\\') || config.run_id.starts_with('.') {
        return Err(HarnessError::invalid_config(format!(
            "--run-id '{}' must be a plain file name",
            config.run_id
        )));
    }
    if overlaps(&config.data_dir, &config.checkpoint_dir) {
        return Err(HarnessError::invalid_config(format!(
            "--data-dir {} and --checkpoint-dir {} must not contain one another",
            config.data_dir.display(),
            config.checkpoint_dir.display()
        )));
    }
    for (key, _) in &config.server_settings {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return Err(HarnessError::invalid_config(format!(
                "--pg-setting name '{}' is not a valid server parameter",
                key
            )));
        }
    }
    Ok(())
}

/// Parse `key=value` from `--pg-setting`.
pub fn parse_setting(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing setting name in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_env<T: FromStr>(env: &EnvSnapshot, key: &str) -> Result<Option<T>> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            HarnessError::invalid_config(format!("{}='{}' is not a valid number", key, raw))
        }),
    }
}

fn parse_selection_env(env: &EnvSnapshot, key: &str) -> Result<Option<WorkloadSelection>> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => WorkloadSelection::parse(raw)
            .map(Some)
            .map_err(|e| HarnessError::invalid_config(format!("{}: {}", key, e))),
    }
}

fn required_path(path: Option<PathBuf>, flag: &str, ctx: &ResolveContext) -> Result<PathBuf> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(absolutize(&p, &ctx.cwd)),
        _ => Err(HarnessError::invalid_config(format!("{} must not be empty", flag))),
    }
}

fn required_text(value: Option<String>, flag: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(HarnessError::invalid_config(format!("{} must not be empty", flag))),
    }
}

/// Join relative paths onto `cwd` and drop `.`/`..` lexically.
fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
