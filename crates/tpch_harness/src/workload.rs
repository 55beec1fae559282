//! Query workloads against a ready server: measured benchmark passes and
//! memory-driven warmup rounds.
//!
//! Items are the `*.sql` files of a directory; the identifier is the file stem.
//! A failing item is recorded in the [`RunResult`] and the run continues. Only
//! a failure to connect at all aborts the run.

use crate::config::{Config, WorkloadSelection};
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor};
use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};

const QUERY_EXTENSION: &str = "sql";

/// Placeholder substitutions for qgen templates.
const DEFAULT_PARAMETERS: &[(&str, &str)] = &[(":1", "90"), (":2", "15"), (":3", "3")];

/// Below this share of the target, warmup warns that memory was not reached.
const LOW_MEMORY_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadMode {
    Warmup,
    Benchmark,
}

impl fmt::Display for WorkloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadMode::Warmup => f.write_str("warmup"),
            WorkloadMode::Benchmark => f.write_str("benchmark"),
        }
    }
}

impl FromStr for WorkloadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warmup" => Ok(Self::Warmup),
            "benchmark" => Ok(Self::Benchmark),
            other => Err(format!("unknown mode '{}' (use warmup or benchmark)", other)),
        }
    }
}

/// One query definition on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadItem {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed { error: String },
}

impl ItemStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemStatus::Succeeded)
    }
}

/// Outcome of one measured execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ItemStatus,
    pub elapsed_secs: f64,
    pub rows: u64,
    pub warmup_passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStopReason {
    TargetReached,
    RoundsExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupRound {
    pub round: u32,
    pub items: Vec<ItemResult>,
    /// Resident memory of the server after the round; `None` if sampling failed.
    pub memory_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupSummary {
    pub target_memory_gb: f64,
    pub rounds: Vec<WarmupRound>,
    pub stop_reason: WarmupStopReason,
}

/// Structured artifact of one workload execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub mode: WorkloadMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<WarmupSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_errors: Vec<String>,
    pub success: bool,
    pub output_path: PathBuf,
}

impl RunResult {
    pub fn failed_items(&self) -> usize {
        self.items.iter().filter(|i| !i.status.is_success()).count()
    }

    /// Sum of measured time over successful items.
    pub fn total_secs(&self) -> f64 {
        self.items
            .iter()
            .filter(|i| i.status.is_success())
            .map(|i| i.elapsed_secs)
            .sum()
    }
}

/// Write `result` to its `output_path` as pretty JSON. Never overwrites.
pub fn write_result(result: &RunResult) -> Result<PathBuf> {
    let path = &result.output_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(result)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => HarnessError::invalid_config(format!(
                "result {} already exists; pick another --run-id",
                path.display()
            )),
            _ => HarnessError::io(path, e),
        })?;
    file.write_all(&json).map_err(|e| HarnessError::io(path, e))?;
    info!("Results saved to {}", path.display());
    Ok(path.clone())
}

/// List `*.sql` items in `dir`, numeric identifiers first in numeric order.
pub fn discover(dir: &Path) -> Result<Vec<WorkloadItem>> {
    let entries = fs::read_dir(dir).map_err(|e| HarnessError::io(dir, e))?;
    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(QUERY_EXTENSION) {
            continue;
        }
        if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
            items.push(WorkloadItem {
                id: id.to_string(),
                path,
            });
        }
    }
    items.sort_by(|a, b| compare_ids(&a.id, &b.id));
    Ok(items)
}

/// Numeric ids in numeric order, then everything else lexically.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Narrow discovered items to a selection, in selection order.
pub fn select(
    available: &[WorkloadItem],
    selection: &WorkloadSelection,
    dir: &Path,
) -> Result<Vec<WorkloadItem>> {
    if available.is_empty() {
        return Err(HarnessError::invalid_config(format!(
            "no .{} files in workload directory {}",
            QUERY_EXTENSION,
            dir.display()
        )));
    }
    match selection {
        WorkloadSelection::All => Ok(available.to_vec()),
        WorkloadSelection::Items(ids) => {
            let missing: Vec<&str> = ids
                .iter()
                .filter(|id| !available.iter().any(|item| &item.id == *id))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(HarnessError::invalid_config(format!(
                    "no definition for {} in {}",
                    missing.join(", "),
                    dir.display()
                )));
            }
            Ok(ids
                .iter()
                .filter_map(|id| available.iter().find(|item| &item.id == id).cloned())
                .collect())
        }
    }
}

/// Turn a qgen template into executable SQL.
///
/// Blank lines and lines starting with `:`, `{` or `--` are dropped, then the
/// `:1`..`:3` placeholders get fixed values.
pub fn prepare_query(template: &str) -> String {
    let mut sql = String::with_capacity(template.len());
    for line in template.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with(':')
            || trimmed.starts_with('{')
            || trimmed.starts_with("--")
        {
            continue;
        }
        sql.push_str(line);
        sql.push('\n');
    }
    for (placeholder, value) in DEFAULT_PARAMETERS {
        sql = sql.replace(placeholder, value);
    }
    sql
}

/// An open connection that can execute item SQL.
#[async_trait]
pub trait QuerySession: Send {
    /// Execute possibly multi-statement SQL, returning the number of rows produced.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens sessions. Connection failure must be `WorkloadConnect`.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QuerySession>>;
}

/// Resident memory of the server processes.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn sample_gb(&self) -> Result<f64>;
}

/// What the orchestrator needs from a workload runner.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    async fn run(&self, config: &Config, mode: WorkloadMode) -> Result<RunResult>;
}

/// sqlx-backed sessions.
pub struct PgSessionFactory {
    options: PgConnectOptions,
    endpoint: String,
}

impl PgSessionFactory {
    pub fn from_config(config: &Config) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .application_name("tpch-harness")
            .disable_statement_logging();
        if !config.password.is_empty() {
            options = options.password(config.password.expose());
        }
        Self {
            options,
            endpoint: config.endpoint(),
        }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn connect(&self) -> Result<Box<dyn QuerySession>> {
        debug!("Connecting to {}", self.endpoint);
        let conn = sqlx::PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| HarnessError::WorkloadConnect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: sqlx::PgConnection,
}

#[async_trait]
impl QuerySession for PgSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let rows = Executor::fetch_all(&mut self.conn,
            sqlx::raw_sql(sql))
            .await
            .map_err(|e| HarnessError::database("query", e))?;
        Ok(rows.len() as u64)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| HarnessError::database("disconnect", e))
    }
}

/// Sums RSS of processes named `postgres` from `ps -eo rss=,comm=`.
pub struct PsMemoryProbe;

#[async_trait]
impl MemoryProbe for PsMemoryProbe {
    async fn sample_gb(&self) -> Result<f64> {
        let output = tokio::process::Command::new("ps")
            .args(["-eo", "rss=,comm="])
            .output()
            .await
            .map_err(|e| crate::process::spawn_error("ps", e))?;
        if !output.status.success() {
            return Err(crate::process::command_error("ps", &output));
        }
        let kib = sum_rss_kib(
            &String::from_utf8_lossy(&output.stdout),
            crate::process::SERVER_PROCESS_NAME,
        );
        Ok(kib as f64 / (1024.0 * 1024.0))
    }
}

/// Total `rss` (KiB) of `ps -eo rss=,comm=` lines whose command is `name`.
pub fn sum_rss_kib(ps_output: &str, name: &str) -> u64 {
    ps_output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let rss = parts.next()?.parse::<u64>().ok()?;
            let comm = parts.next()?;
            (comm == name).then_some(rss)
        })
        .sum()
}

/// Runs workloads over sessions from a [`SessionFactory`].
pub struct WorkloadRunner {
    sessions: Box<dyn SessionFactory>,
    memory: Box<dyn MemoryProbe>,
}

impl WorkloadRunner {
    pub fn new(sessions: Box<dyn SessionFactory>, memory: Box<dyn MemoryProbe>) -> Self {
        Self { sessions, memory }
    }

    /// Runner against the configured PostgreSQL server.
    pub fn postgres(config: &Config) -> Self {
        Self::new(
            Box::new(PgSessionFactory::from_config(config)),
            Box::new(PsMemoryProbe),
        )
    }

    async fn benchmark(&self, config: &Config, items: &[WorkloadItem]) -> Result<RunResult> {
        let started_at = Utc::now();
        let warmup_passes = config.warmup.count();
        let mut session = self.sessions.connect().await?;

        for sql in &config.before_sql {
            debug!("before hook: {}", sql);
            if let Err(e) = session.execute(sql).await {
                let _ = session.close().await;
                return Err(HarnessError::WorkloadHook {
                    sql: sql.clone(),
                    reason: e.to_string(),
                });
            }
        }

        info!(
            "Running {} item(s), {} warmup pass(es) each",
            items.len(),
            warmup_passes
        );
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(run_item(session.as_mut(), item, warmup_passes).await);
        }

        let mut hook_errors = Vec::new();
        for sql in &config.after_sql {
            debug!("after hook: {}", sql);
            if let Err(e) = session.execute(sql).await {
                warn!("After hook failed ({}): {}", sql, e);
                hook_errors.push(format!("{}: {}", sql, e));
            }
        }

        if let Err(e) = session.close().await {
            debug!("close failed: {}", e);
        }

        let success = results.iter().all(|r| r.status.is_success()) && hook_errors.is_empty();
        Ok(RunResult {
            run_id: config.run_id.clone(),
            mode: WorkloadMode::Benchmark,
            started_at,
            finished_at: Utc::now(),
            items: results,
            warmup: None,
            hook_errors,
            success,
            output_path: config.result_path(),
        })
    }

    async fn warmup(&self, config: &Config, items: &[WorkloadItem]) -> Result<RunResult> {
        let started_at = Utc::now();
        let target = config.target_memory_gb;
        let mut session = self.sessions.connect().await?;

        if let Some(initial) = self.sample().await {
            info!("Initial server memory: {:.2} GB (target {} GB)", initial, target);
        }

        let mut rounds = Vec::new();
        let mut stop_reason = WarmupStopReason::RoundsExhausted;
        for round in 1..=config.warmup_rounds {
            info!("Warmup round {}/{}", round, config.warmup_rounds);
            let mut round_items = Vec::with_capacity(items.len());
            for item in items {
                round_items.push(run_item(session.as_mut(), item, 0).await);
            }

            let memory_gb = self.sample().await;
            if let Some(gb) = memory_gb {
                info!("Server memory after round {}: {:.2} GB", round, gb);
            }
            rounds.push(WarmupRound {
                round,
                items: round_items,
                memory_gb,
            });

            if memory_gb.map_or(false, |gb| gb >= target) {
                info!("Memory target of {} GB reached", target);
                stop_reason = WarmupStopReason::TargetReached;
                break;
            }
        }

        if let Err(e) = session.close().await {
            debug!("close failed: {}", e);
        }

        let last = rounds.last().and_then(|r| r.memory_gb).unwrap_or(0.0);
        if stop_reason == WarmupStopReason::RoundsExhausted && last < target * LOW_MEMORY_RATIO {
            warn!(
                "Warmup finished at {:.2} GB, below the {} GB target. Consider more --warmup-rounds, a larger --scale-factor, or a larger shared_buffers (--pg-setting)",
                last, target
            );
        }

        let success = rounds
            .iter()
            .flat_map(|r| r.items.iter())
            .all(|i| i.status.is_success());
        Ok(RunResult {
            run_id: config.run_id.clone(),
            mode: WorkloadMode::Warmup,
            started_at,
            finished_at: Utc::now(),
            items: Vec::new(),
            warmup: Some(WarmupSummary {
                target_memory_gb: target,
                rounds,
                stop_reason,
            }),
            hook_errors: Vec::new(),
            success,
            output_path: config.warmup_result_path(),
        })
    }

    async fn sample(&self) -> Option<f64> {
        match self.memory.sample_gb().await {
            Ok(gb) => Some(gb),
            Err(e) => {
                warn!("Could not sample server memory: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl WorkloadDriver for WorkloadRunner {
    async fn run(&self, config: &Config, mode: WorkloadMode) -> Result<RunResult> {
        let available = discover(&config.query_dir)?;
        let selection = match mode {
            WorkloadMode::Benchmark => &config.queries,
            WorkloadMode::Warmup => &config.warmup_queries,
        };
        let items = select(&available, selection, &config.query_dir)?;

        match mode {
            WorkloadMode::Benchmark => self.benchmark(config, &items).await,
            WorkloadMode::Warmup => self.warmup(config, &items).await,
        }
    }
}

async fn run_item(session: &mut dyn QuerySession, item: &WorkloadItem, warmup_passes: u32) -> ItemResult {
    let failed = |error: String| ItemResult {
        id: item.id.clone(),
        status: ItemStatus::Failed { error },
        elapsed_secs: 0.0,
        rows: 0,
        warmup_passes,
    };

    let sql = match fs::read_to_string(&item.path) {
        Ok(text) => prepare_query(&text),
        Err(e) => {
            warn!("Item {}: cannot read {}: {}", item.id, item.path.display(), e);
            return failed(format!("cannot read {}: {}", item.path.display(), e));
        }
    };

    for pass in 1..=warmup_passes {
        if let Err(e) = session.execute(&sql).await {
            warn!("Item {} warmup pass {} failed: {}", item.id, pass, e);
        }
    }

    let started = Instant::now();
    match session.execute(&sql).await {
        Ok(rows) => {
            let elapsed = started.elapsed().as_secs_f64();
            info!("Item {} completed in {:.2}s ({} rows)", item.id, elapsed, rows);
            ItemResult {
                id: item.id.clone(),
                status: ItemStatus::Succeeded,
                elapsed_secs: elapsed,
                rows,
                warmup_passes,
            }
        }
        Err(e) => {
            warn!("Item {} failed: {}", item.id, e);
            failed(e.to_string())
        }
    }
}
