//! The external TPC-H data generator (`dbgen`).

use crate::error::{HarnessError, Result};
use crate::process::{command_error, spawn_error};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// TPC-H tables in load order: reference tables first, fact tables last.
pub const TABLES: [&str; 8] = [
    "region", "nation", "customer", "supplier", "part", "partsupp", "orders", "lineitem",
];

const DBGEN_BINARY: &str = "dbgen";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Generated,
    /// All table files were already present.
    Skipped,
}

/// Builds the generator and produces `<table>.tbl` files.
#[async_trait]
pub trait DataGenerator: Send + Sync {
    /// Build the generator if its binary is missing.
    async fn ensure_built(&self) -> Result<()>;

    /// Generate table files unless present; `regenerate` forces a fresh run.
    async fn generate(&self, scale_factor: f64, regenerate: bool) -> Result<GenerateOutcome>;
}

/// Path of a table's data file inside the generator directory.
pub fn table_file(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{}.tbl", table))
}

/// Tables whose data file is missing.
pub fn missing_tables(dir: &Path) -> Vec<&'static str> {
    TABLES
        .iter()
        .copied()
        .filter(|t| !table_file(dir, t).is_file())
        .collect()
}

/// `1.0` -> `"1"`, `0.1` -> `"0.1"`.
pub fn format_scale(scale_factor: f64) -> String {
    if scale_factor.fract() == 0.0 {
        format!("{}", scale_factor as u64)
    } else {
        format!("{}", scale_factor)
    }
}

/// The generator checked out at `dir`, built with `make`.
pub struct DbgenTool {
    dir: PathBuf,
}

impl DbgenTool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn binary(&self) -> PathBuf {
        self.dir.join(DBGEN_BINARY)
    }

    fn require_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(HarnessError::invalid_config(format!(
                "--dbgen-dir {} does not exist",
                self.dir.display()
            )))
        }
    }
}

#[async_trait]
impl DataGenerator for DbgenTool {
    async fn ensure_built(&self) -> Result<()> {
        self.require_dir()?;
        if self.binary().is_file() {
            info!("dbgen already built in {}", self.dir.display());
            return Ok(());
        }

        let make = which::which("make").map_err(|e| HarnessError::Command {
            program: "make".to_string(),
            detail: format!("not found on PATH: {}", e),
        })?;
        info!("Building dbgen in {}", self.dir.display());
        let output = Command::new(make)
            .current_dir(&self.dir)
            .output()
            .await
            .map_err(|e| spawn_error("make", e))?;
        if !output.status.success() {
            return Err(command_error("make", &output));
        }

        if !self.binary().is_file() {
            return Err(HarnessError::Command {
                program: "make".to_string(),
                detail: format!("finished but {} is missing", self.binary().display()),
            });
        }
        Ok(())
    }

    async fn generate(&self, scale_factor: f64, regenerate: bool) -> Result<GenerateOutcome> {
        self.require_dir()?;
        let missing = missing_tables(&self.dir);
        if missing.is_empty() && !regenerate {
            info!(
                "Table files already present in {}, skipping generation (use --regenerate to rebuild)",
                self.dir.display()
            );
            return Ok(GenerateOutcome::Skipped);
        }

        let scale = format_scale(scale_factor);
        info!("Generating TPC-H data at scale factor {}", scale);
        let output = Command::new(self.binary())
            .args(["-s", &scale, "-f"])
            .current_dir(&self.dir)
            .output()
            .await
            .map_err(|e| spawn_error("dbgen", e))?;
        if !output.status.success() {
            return Err(command_error("dbgen", &output));
        }

        let missing = missing_tables(&self.dir);
        if !missing.is_empty() {
            return Err(HarnessError::Command {
                program: "dbgen".to_string(),
                detail: format!("did not produce {}", missing.join(", ")),
            });
        }
        Ok(GenerateOutcome::Generated)
    }
}
