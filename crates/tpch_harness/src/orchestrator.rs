//! The setup and run workflows.
//!
//! Both are strict linear sequences. The first failing step ends the workflow;
//! once a server has been started it is stopped again before returning, and a
//! failure of that stop is attached as `cleanup` without replacing the
//! primary error.

use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::config::Config;
use crate::dbgen::{DataGenerator, GenerateOutcome};
use crate::error::{HarnessError, Result};
use crate::loader::{DataLoader, TableLoad};
use crate::process::{ServerControl, ServerHandle, StopAnyOutcome};
use crate::workload::{self, RunResult, WorkloadDriver, WorkloadItem, WorkloadMode};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Workflow steps, as they appear in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Preflight,
    EnsureGenerator,
    GenerateData,
    StopAnyRunningServer,
    InitServer,
    RestoreCheckpoint,
    StartServer,
    AwaitReady,
    CreateDatabaseAndRoles,
    LoadSchemaAndData,
    CreateConstraintsAndIndexes,
    Analyze,
    RunWarmup,
    RunWorkload,
    StopServer,
    SaveCheckpoint,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Preflight => "preflight",
            Step::EnsureGenerator => "ensure generator",
            Step::GenerateData => "generate data",
            Step::StopAnyRunningServer => "stop running server",
            Step::InitServer => "init server",
            Step::RestoreCheckpoint => "restore checkpoint",
            Step::StartServer => "start server",
            Step::AwaitReady => "await ready",
            Step::CreateDatabaseAndRoles => "create database",
            Step::LoadSchemaAndData => "load data",
            Step::CreateConstraintsAndIndexes => "create constraints and indexes",
            Step::Analyze => "analyze",
            Step::RunWarmup => "warmup",
            Step::RunWorkload => "run workload",
            Step::StopServer => "stop server",
            Step::SaveCheckpoint => "save checkpoint",
        };
        f.write_str(name)
    }
}

const RUN_STEPS: usize = 7;
const SETUP_STEPS: usize = 14;

/// A workflow that stopped at `step`.
#[derive(Debug, Error)]
#[error("{step} failed: {primary}")]
pub struct WorkflowError {
    pub step: Step,
    pub primary: HarnessError,
    /// Failure of the cleanup stop that followed, if any.
    pub cleanup: Option<HarnessError>,
}

impl WorkflowError {
    fn new(step: Step, primary: HarnessError) -> Self {
        Self {
            step,
            primary,
            cleanup: None,
        }
    }
}

/// A completed benchmark run.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: RunResult,
    pub result_path: PathBuf,
    /// The final stop failed after a successful workload.
    pub stop_warning: Option<HarnessError>,
}

/// A completed setup.
#[derive(Debug)]
pub struct SetupOutcome {
    pub generated: GenerateOutcome,
    pub tables: Vec<TableLoad>,
    pub warmup: RunResult,
    pub warmup_path: PathBuf,
    pub checkpoint: CheckpointMeta,
}

/// Logs `step i/N` on entry and the elapsed time on exit.
struct Progress {
    total: usize,
    current: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self { total, current: 0 }
    }

    async fn run<T, F>(&mut self, step: Step, work: F) -> std::result::Result<T, WorkflowError>
    where
        F: Future<Output = Result<T>>,
    {
        self.current += 1;
        info!("step {}/{}: {}", self.current, self.total, step);
        let started = Instant::now();
        match work.await {
            Ok(value) => {
                info!(
                    "step {}/{}: {} finished in {:.1}s",
                    self.current,
                    self.total,
                    step,
                    started.elapsed().as_secs_f64()
                );
                Ok(value)
            }
            Err(e) => {
                error!("step {}/{}: {} failed: {}", self.current, self.total, step, e);
                Err(WorkflowError::new(step, e))
            }
        }
    }
}

/// Checks done before any destructive run step. Returns the selected items.
pub fn preflight_run(config: &Config) -> Result<Vec<WorkloadItem>> {
    if !config.checkpoint_dir.is_dir() {
        return Err(HarnessError::CheckpointMissing {
            path: config.checkpoint_dir.clone(),
        });
    }
    let items = preflight_items(config, WorkloadMode::Benchmark)?;
    refuse_existing_result(config, WorkloadMode::Benchmark)?;
    Ok(items)
}

/// Checks done before setup spends time generating and loading data.
pub fn preflight_setup(config: &Config) -> Result<Vec<WorkloadItem>> {
    let items = preflight_items(config, WorkloadMode::Warmup)?;
    refuse_existing_result(config, WorkloadMode::Warmup)?;
    Ok(items)
}

/// Results are never overwritten; a reused run id fails before any work.
pub fn refuse_existing_result(config: &Config, mode: WorkloadMode) -> Result<()> {
    let path = match mode {
        WorkloadMode::Benchmark => config.result_path(),
        WorkloadMode::Warmup => config.warmup_result_path(),
    };
    if path.exists() {
        return Err(HarnessError::invalid_config(format!(
            "--run-id {} already has a result at {}",
            config.run_id,
            path.display()
        )));
    }
    Ok(())
}

fn preflight_items(config: &Config, mode: WorkloadMode) -> Result<Vec<WorkloadItem>> {
    if !config.query_dir.is_dir() {
        return Err(HarnessError::invalid_config(format!(
            "--query-dir {} does not exist",
            config.query_dir.display()
        )));
    }
    let available = workload::discover(&config.query_dir)?;
    let selection = match mode {
        WorkloadMode::Benchmark => &config.queries,
        WorkloadMode::Warmup => &config.warmup_queries,
    };
    workload::select(&available, selection, &config.query_dir)
}

/// Drives the workflows over pluggable components.
pub struct Orchestrator {
    server: Box<dyn ServerControl>,
    workload: Box<dyn WorkloadDriver>,
    generator: Box<dyn DataGenerator>,
    loader: Box<dyn DataLoader>,
    checkpoints: CheckpointManager,
}

impl Orchestrator {
    pub fn new(
        server: Box<dyn ServerControl>,
        workload: Box<dyn WorkloadDriver>,
        generator: Box<dyn DataGenerator>,
        loader: Box<dyn DataLoader>,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            server,
            workload,
            generator,
            loader,
            checkpoints,
        }
    }

    /// Restore, start, await ready, run the benchmark, stop.
    pub async fn run(&self, config: &Config) -> std::result::Result<RunOutcome, WorkflowError> {
        let mut progress = Progress::new(RUN_STEPS);

        let items = progress
            .run(Step::Preflight, async { preflight_run(config) })
            .await?;
        info!("Run {}: {} item(s) selected", config.run_id, items.len());

        progress
            .run(Step::StopAnyRunningServer, self.stop_any())
            .await?;
        progress
            .run(Step::RestoreCheckpoint, self.restore_checkpoint(config))
            .await?;
        let mut handle = progress
            .run(
                Step::StartServer,
                self.server.start(&config.data_dir, &config.server_log),
            )
            .await?;

        let measured = self.measure(config, &mut handle, &mut progress).await;
        let (result, result_path) = match measured {
            Ok(value) => value,
            Err(mut failure) => {
                failure.cleanup = self.cleanup_stop(&mut handle).await;
                return Err(failure);
            }
        };

        let stop_warning = match progress
            .run(Step::StopServer, self.server.stop(&mut handle))
            .await
        {
            Ok(()) => None,
            Err(failure) => {
                warn!("Results were saved, but the server did not stop cleanly");
                Some(failure.primary)
            }
        };

        Ok(RunOutcome {
            result,
            result_path,
            stop_warning,
        })
    }

    async fn measure(
        &self,
        config: &Config,
        handle: &mut ServerHandle,
        progress: &mut Progress,
    ) -> std::result::Result<(RunResult, PathBuf), WorkflowError> {
        progress
            .run(Step::AwaitReady, self.server.await_ready(handle))
            .await?;
        progress
            .run(Step::RunWorkload, async {
                let result = self.workload.run(config, WorkloadMode::Benchmark).await?;
                let path = workload::write_result(&result)?;
                Ok::<_, HarnessError>((result, path))
            })
            .await
    }

    /// Build and load a fresh dataset, warm it, and save it as the checkpoint.
    pub async fn setup(&self, config: &Config) -> std::result::Result<SetupOutcome, WorkflowError> {
        let mut progress = Progress::new(SETUP_STEPS);

        progress
            .run(Step::Preflight, async { preflight_setup(config) })
            .await?;
        progress
            .run(Step::EnsureGenerator, self.generator.ensure_built())
            .await?;
        let generated = progress
            .run(
                Step::GenerateData,
                self.generator.generate(config.scale_factor, config.regenerate),
            )
            .await?;
        progress
            .run(Step::StopAnyRunningServer, self.stop_any())
            .await?;
        progress
            .run(Step::InitServer, self.server.init(&config.data_dir))
            .await?;
        let mut handle = progress
            .run(
                Step::StartServer,
                self.server.start(&config.data_dir, &config.server_log),
            )
            .await?;

        let prepared = self.prepare(config, &mut handle, &mut progress).await;
        let (tables, warmup, warmup_path) = match prepared {
            Ok(value) => value,
            Err(mut failure) => {
                failure.cleanup = self.cleanup_stop(&mut handle).await;
                return Err(failure);
            }
        };

        // A checkpoint needs a stopped server, so here a failed stop is fatal.
        progress
            .run(Step::StopServer, self.server.stop(&mut handle))
            .await?;
        let checkpoint = progress
            .run(Step::SaveCheckpoint, self.save_checkpoint(config))
            .await?;

        Ok(SetupOutcome {
            generated,
            tables,
            warmup,
            warmup_path,
            checkpoint,
        })
    }

    async fn prepare(
        &self,
        config: &Config,
        handle: &mut ServerHandle,
        progress: &mut Progress,
    ) -> std::result::Result<(Vec<TableLoad>, RunResult, PathBuf), WorkflowError> {
        progress
            .run(Step::AwaitReady, self.server.await_ready(handle))
            .await?;
        progress
            .run(Step::CreateDatabaseAndRoles, self.loader.create_database())
            .await?;
        let tables = progress
            .run(
                Step::LoadSchemaAndData,
                self.loader.load_tables(&config.dbgen_dir),
            )
            .await?;
        progress
            .run(
                Step::CreateConstraintsAndIndexes,
                self.loader.create_constraints(),
            )
            .await?;
        progress.run(Step::Analyze, self.loader.analyze()).await?;
        let (warmup, path) = progress
            .run(Step::RunWarmup, async {
                let result = self.workload.run(config, WorkloadMode::Warmup).await?;
                let path = workload::write_result(&result)?;
                Ok::<_, HarnessError>((result, path))
            })
            .await?;
        Ok((tables, warmup, path))
    }

    async fn restore_checkpoint(&self, config: &Config) -> Result<()> {
        let checkpoints = self.checkpoints;
        let checkpoint = config.checkpoint_dir.clone();
        let target = config.data_dir.clone();
        tokio::task::spawn_blocking(move || checkpoints.restore(&checkpoint, &target)).await??;
        Ok(())
    }

    async fn save_checkpoint(&self, config: &Config) -> Result<CheckpointMeta> {
        let checkpoints = self.checkpoints;
        let source = config.data_dir.clone();
        let checkpoint = config.checkpoint_dir.clone();
        let scale_factor = config.scale_factor;
        tokio::task::spawn_blocking(move || {
            checkpoints.save(&source, &checkpoint, Some(scale_factor))
        })
        .await?
    }

    async fn stop_any(&self) -> Result<()> {
        match self.server.stop_any().await? {
            StopAnyOutcome::Terminated => info!("Stopped a running server"),
            StopAnyOutcome::NothingRunning => info!("No server was running"),
        }
        Ok(())
    }

    async fn cleanup_stop(&self, handle: &mut ServerHandle) -> Option<HarnessError> {
        info!("Stopping server after failure");
        match self.server.stop(handle).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Cleanup stop failed: {}", e);
                Some(e)
            }
        }
    }
}
