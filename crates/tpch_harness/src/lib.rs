//! TPC-H Harness - Core Library
//!
//! Sets up a TPC-H dataset in PostgreSQL once, saves the stopped data
//! directory as a checkpoint, and benchmarks queries against fresh restores
//! of that checkpoint.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dbgen;
pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod process;
pub mod workload;

pub use checkpoint::{CheckpointInfo, CheckpointManager, CheckpointMeta};
pub use config::{
    resolve, Config, ConfigLayer, EnvSnapshot, ResolveContext, Secret, WarmupPasses,
    WorkloadSelection,
};
pub use error::{HarnessError, Result};
pub use orchestrator::{Orchestrator, RunOutcome, SetupOutcome, Step, WorkflowError};
pub use process::{
    ProcessController, ReadinessPolicy, ReadinessProbe, ServerControl, ServerHandle, ServerState,
    StopAnyOutcome,
};
pub use workload::{
    ItemResult, ItemStatus, RunResult, WorkloadDriver, WorkloadMode, WorkloadRunner,
};
