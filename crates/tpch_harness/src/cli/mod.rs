//! `tpch-harness` command line.

pub mod error;
pub mod output;

use crate::checkpoint::CheckpointManager;
use crate::config::{
    parse_setting, resolve, warmup_choice, Config, ConfigLayer, EnvSnapshot, ResolveContext,
    Secret, WorkloadSelection,
};
use crate::dbgen::DbgenTool;
use crate::error::HarnessError;
use crate::loader::PgLoader;
use crate::orchestrator::{refuse_existing_result, Orchestrator};
use crate::process::ProcessController;
use crate::workload::{self, WorkloadDriver, WorkloadMode, WorkloadRunner};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub use error::HelpfulError;

#[derive(Parser, Debug)]
#[command(
    name = "tpch-harness",
    version,
    about = "Set up a TPC-H dataset once, then benchmark against restored checkpoints"
)]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build dbgen, generate and load data, warm up, and save the checkpoint
    Setup {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Restore the checkpoint, start the server, run the benchmark, stop
    Run {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run queries against an already running server (no lifecycle management)
    Workload {
        /// warmup or benchmark
        #[arg(long, default_value = "benchmark")]
        mode: WorkloadMode,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show checkpoint, data directory and server state
    Status {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Flags for every configuration field. Unset flags fall through to the
/// environment and then to built-in defaults.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Directory containing initdb and pg_ctl [env: TPCH_PG_BIN]
    #[arg(long)]
    pub pg_bin: Option<PathBuf>,

    /// Server library directory, added to LD_LIBRARY_PATH [env: TPCH_PG_LIB]
    #[arg(long)]
    pub pg_lib: Option<PathBuf>,

    /// Active data directory [env: PGDATA]
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Checkpoint directory [env: TPCH_CHECKPOINT_DIR]
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Directory of <id>.sql query files [env: TPCH_QUERY_DIR]
    #[arg(long)]
    pub query_dir: Option<PathBuf>,

    /// Where result JSON files are written [env: TPCH_RESULTS_DIR]
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// dbgen checkout; generated .tbl files land here [env: TPCH_DBGEN_DIR]
    #[arg(long)]
    pub dbgen_dir: Option<PathBuf>,

    /// Server log file [env: TPCH_SERVER_LOG]
    #[arg(long)]
    pub server_log: Option<PathBuf>,

    /// [env: PGHOST]
    #[arg(long)]
    pub host: Option<String>,

    /// [env: PGPORT]
    #[arg(long)]
    pub port: Option<u16>,

    /// Database name [env: PGDATABASE]
    #[arg(long)]
    pub dbname: Option<String>,

    /// [env: PGUSER]
    #[arg(long)]
    pub user: Option<String>,

    /// Prefer PGPASSWORD; flags are visible to other users in ps
    #[arg(long)]
    pub password: Option<Secret>,

    /// Comma-separated query ids, empty for all [env: TPCH_QUERIES]
    #[arg(long, value_parser = WorkloadSelection::parse)]
    pub queries: Option<WorkloadSelection>,

    /// Result file name stem [env: TPCH_RUN_ID]
    #[arg(long)]
    pub run_id: Option<String>,

    /// Unmeasured passes before each measured query [env: TPCH_WARMUP_ITERATIONS]
    #[arg(long)]
    pub warmup_iterations: Option<u32>,

    /// No warmup passes [env: TPCH_SKIP_WARMUP]
    #[arg(long)]
    pub skip_warmup: bool,

    /// dbgen scale factor [env: TPCH_SCALE_FACTOR]
    #[arg(long)]
    pub scale_factor: Option<f64>,

    /// Warmup stops once server memory reaches this many GB [env: TPCH_TARGET_MEMORY_GB]
    #[arg(long)]
    pub target_memory: Option<f64>,

    /// Maximum warmup rounds [env: TPCH_WARMUP_ROUNDS]
    #[arg(long)]
    pub warmup_rounds: Option<u32>,

    /// Query ids used for warmup rounds, empty for all [env: TPCH_WARMUP_QUERIES]
    #[arg(long, value_parser = WorkloadSelection::parse)]
    pub warmup_queries: Option<WorkloadSelection>,

    /// Readiness probe attempts [env: TPCH_READY_ATTEMPTS]
    #[arg(long)]
    pub ready_attempts: Option<u32>,

    /// Delay between readiness attempts [env: TPCH_READY_INTERVAL_MS]
    #[arg(long)]
    pub ready_interval_ms: Option<u64>,

    /// Grace period for server shutdown [env: TPCH_STOP_TIMEOUT_SECS]
    #[arg(long)]
    pub stop_timeout_secs: Option<u64>,

    /// Regenerate table files even if present
    #[arg(long)]
    pub regenerate: bool,

    /// SQL run once before the measured queries (repeatable)
    #[arg(long = "before-sql")]
    pub before_sql: Vec<String>,

    /// SQL run once after the measured queries (repeatable)
    #[arg(long = "after-sql")]
    pub after_sql: Vec<String>,

    /// Extra postgresql.conf setting for setup, key=value (repeatable)
    #[arg(long = "pg-setting", value_parser = parse_setting)]
    pub pg_settings: Vec<(String, String)>,
}

impl TryFrom<&ConfigArgs> for ConfigLayer {
    type Error = HarnessError;

    fn try_from(args: &ConfigArgs) -> std::result::Result<Self, Self::Error> {
        let warmup = warmup_choice(
            args.warmup_iterations,
            args.skip_warmup,
            "--warmup-iterations",
            "--skip-warmup",
        )?;
        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

        Ok(ConfigLayer {
            pg_bin_dir: args.pg_bin.clone(),
            pg_lib_dir: args.pg_lib.clone(),
            data_dir: args.data_dir.clone(),
            checkpoint_dir: args.checkpoint_dir.clone(),
            query_dir: args.query_dir.clone(),
            results_dir: args.results_dir.clone(),
            dbgen_dir: args.dbgen_dir.clone(),
            server_log: args.server_log.clone(),
            host: args.host.clone(),
            port: args.port,
            database: args.dbname.clone(),
            user: args.user.clone(),
            password: args.password.clone(),
            queries: args.queries.clone(),
            run_id: args.run_id.clone(),
            warmup,
            scale_factor: args.scale_factor,
            target_memory_gb: args.target_memory,
            warmup_rounds: args.warmup_rounds,
            warmup_queries: args.warmup_queries.clone(),
            ready_attempts: args.ready_attempts,
            ready_interval: args.ready_interval_ms.map(Duration::from_millis),
            stop_timeout: args.stop_timeout_secs.map(Duration::from_secs),
            regenerate: args.regenerate.then_some(true),
            before_sql: non_empty(&args.before_sql),
            after_sql: non_empty(&args.after_sql),
            server_settings: (!args.pg_settings.is_empty()).then(|| args.pg_settings.clone()),
        })
    }
}

/// Resolve defaults, process environment and flags into one `Config`.
pub fn resolve_config(args: &ConfigArgs) -> std::result::Result<Config, HarnessError> {
    let home = tpch_harness_logging::harness_home()
        .map_err(|e| HarnessError::invalid_config(e.to_string()))?;
    let ctx = ResolveContext::current(home)?;
    let env = ConfigLayer::from_env(&EnvSnapshot::from_process())?;
    let cli = ConfigLayer::try_from(args)?;
    resolve(ConfigLayer::defaults(&ctx), env, cli, &ctx)
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Setup { config } => cmd_setup(resolve_config(&config)?).await,
        Commands::Run { config } => cmd_run(resolve_config(&config)?).await,
        Commands::Workload { mode, config } => cmd_workload(resolve_config(&config)?, mode).await,
        Commands::Status { config } => cmd_status(resolve_config(&config)?).await,
        Commands::Config { json, config } => cmd_config(&resolve_config(&config)?, json),
    }
}

fn orchestrator(config: &Config) -> Orchestrator {
    Orchestrator::new(
        Box::new(ProcessController::from_config(config)),
        Box::new(WorkloadRunner::postgres(config)),
        Box::new(DbgenTool::new(&config.dbgen_dir)),
        Box::new(PgLoader::from_config(config)),
        CheckpointManager::new(),
    )
}

async fn cmd_setup(config: Config) -> Result<()> {
    let outcome = orchestrator(&config).setup(&config).await?;

    output::print_loads(&outcome.tables);
    output::print_run_summary(&outcome.warmup);
    println!("Warmup results: {}", outcome.warmup_path.display());
    println!(
        "Checkpoint saved: {} ({} files, {})",
        config.checkpoint_dir.display(),
        outcome.checkpoint.files,
        output::format_size(outcome.checkpoint.bytes)
    );
    Ok(())
}

async fn cmd_run(config: Config) -> Result<()> {
    let outcome = orchestrator(&config).run(&config).await?;

    output::print_run_summary(&outcome.result);
    println!("Results: {}", outcome.result_path.display());
    if let Some(stop) = &outcome.stop_warning {
        eprint!("{}", HelpfulError::from(stop).with_context("Cleanup after a completed run"));
    }
    if !outcome.result.success {
        warn!(
            "{} item(s) failed; see {}",
            outcome.result.failed_items(),
            outcome.result_path.display()
        );
    }
    Ok(())
}

async fn cmd_workload(config: Config, mode: WorkloadMode) -> Result<()> {
    refuse_existing_result(&config, mode)?;
    let result = WorkloadRunner::postgres(&config).run(&config, mode).await?;
    let path = workload::write_result(&result)?;
    output::print_run_summary(&result);
    println!("Results: {}", path.display());
    Ok(())
}

async fn cmd_status(config: Config) -> Result<()> {
    let info = CheckpointManager::new()
        .inspect(&config.checkpoint_dir)
        .context("Failed to inspect checkpoint")?;

    let mut rows = vec![vec![
        "Checkpoint".to_string(),
        config.checkpoint_dir.display().to_string(),
        if info.exists { "present" } else { "missing" }.to_string(),
    ]];
    if let Some(meta) = &info.meta {
        rows.push(vec![
            "Saved".to_string(),
            meta.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            format!(
                "{} files, {}, scale factor {}",
                meta.files,
                output::format_size(meta.bytes),
                meta.scale_factor
                    .map(|sf| sf.to_string())
                    .unwrap_or_else(|| "?".to_string())
            ),
        ]);
    }
    rows.push(vec![
        "Data directory".to_string(),
        config.data_dir.display().to_string(),
        if config.data_dir.is_dir() { "present" } else { "missing" }.to_string(),
    ]);

    let controller = ProcessController::from_config(&config);
    let server = match controller.is_running(&config.data_dir).await {
        Ok(true) => "running".to_string(),
        Ok(false) => "stopped".to_string(),
        Err(e) => format!("unknown ({})", e),
    };
    rows.push(vec![
        "Server".to_string(),
        format!("{}:{}", config.host, config.port),
        server,
    ]);

    output::print_table(&["", "Path", "State"], rows);
    Ok(())
}

fn cmd_config(config: &Config, json: bool) -> Result<()> {
    let password = if config.password.is_empty() { "" } else { "***" };
    let value = serde_json::json!({
        "pg_bin_dir": config.pg_bin_dir,
        "pg_lib_dir": config.pg_lib_dir,
        "data_dir": config.data_dir,
        "checkpoint_dir": config.checkpoint_dir,
        "query_dir": config.query_dir,
        "results_dir": config.results_dir,
        "dbgen_dir": config.dbgen_dir,
        "server_log": config.server_log,
        "host": config.host,
        "port": config.port,
        "database": config.database,
        "user": config.user,
        "password": password,
        "queries": config.queries.to_string(),
        "run_id": config.run_id,
        "warmup_iterations": config.warmup.count(),
        "scale_factor": config.scale_factor,
        "target_memory_gb": config.target_memory_gb,
        "warmup_rounds": config.warmup_rounds,
        "warmup_queries": config.warmup_queries.to_string(),
        "ready_attempts": config.ready_attempts,
        "ready_interval_ms": config.ready_interval.as_millis() as u64,
        "stop_timeout_secs": config.stop_timeout.as_secs(),
        "before_sql": config.before_sql,
        "after_sql": config.after_sql,
        "server_settings": config.server_settings,
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let rows = value
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .map(|(key, v)| {
                    let shown = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    vec![key.clone(), shown]
                })
                .collect()
        })
        .unwrap_or_default();
    output::print_table(&["Setting", "Value"], rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_run_flags_reach_layer() {
        let cli = parse(&[
            "tpch-harness",
            "run",
            "--queries",
            "1,6",
            "--warmup-iterations",
            "2",
            "--port",
            "5433",
            "--before-sql",
            "SELECT 1",
        ]);
        let Commands::Run { config } = cli.command else {
            panic!("expected run");
        };
        let layer = ConfigLayer::try_from(&config).unwrap();
        assert_eq!(
            layer.queries,
            Some(WorkloadSelection::Items(vec!["1".into(), "6".into()]))
        );
        assert_eq!(layer.warmup, Some(crate::config::WarmupPasses::Iterations(2)));
        assert_eq!(layer.port, Some(5433));
        assert_eq!(layer.before_sql, Some(vec!["SELECT 1".to_string()]));
        assert_eq!(layer.after_sql, None);
        assert_eq!(layer.regenerate, None);
    }

    #[test]
    fn test_iterations_and_skip_together_is_invalid_config() {
        let cli = parse(&[
            "tpch-harness",
            "run",
            "--warmup-iterations",
            "2",
            "--skip-warmup",
        ]);
        let Commands::Run { config } = cli.command else {
            panic!("expected run");
        };
        let err = ConfigLayer::try_from(&config).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(_)));
    }

    #[test]
    fn test_workload_mode_flag() {
        let cli = parse(&["tpch-harness", "workload", "--mode", "warmup"]);
        assert!(matches!(
            cli.command,
            Commands::Workload {
                mode: WorkloadMode::Warmup,
                ..
            }
        ));
    }

    #[test]
    fn test_pg_setting_flag() {
        let cli = parse(&["tpch-harness", "setup", "--pg-setting", "work_mem=1GB"]);
        let Commands::Setup { config } = cli.command else {
            panic!("expected setup");
        };
        assert_eq!(config.pg_settings, vec![("work_mem".to_string(), "1GB".to_string())]);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = Cli::try_parse_from(["tpch-harness", "run", "--no-such-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
