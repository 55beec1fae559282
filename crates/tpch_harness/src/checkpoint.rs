//! Whole-directory snapshots of a stopped server's data directory.
//!
//! The tree is copied verbatim and never interpreted. Bookkeeping lives in a
//! sidecar `<checkpoint>.meta.json` next to the tree so the tree itself stays
//! byte-identical to the data directory it came from.

use crate::error::{HarnessError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Present in a data directory while a server owns it.
pub const POSTMASTER_PID: &str = "postmaster.pid";

const PARTIAL_SUFFIX: &str = ".partial";
const META_SUFFIX: &str = ".meta.json";

/// Counts from one tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub bytes: u64,
}

/// Sidecar written after a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub created_at: DateTime<Utc>,
    pub source: PathBuf,
    pub files: u64,
    pub bytes: u64,
    pub scale_factor: Option<f64>,
}

/// What `inspect` found.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub meta: Option<CheckpointMeta>,
}

/// Restores and saves checkpoints. Assumes exclusive access to both paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointManager;

impl CheckpointManager {
    pub fn new() -> Self {
        Self
    }

    /// Replace `target` with a copy of `checkpoint`.
    ///
    /// A missing checkpoint is reported before anything is touched. A crash
    /// mid-copy leaves `target` partial; the next restore starts over.
    pub fn restore(&self, checkpoint: &Path, target: &Path) -> Result<CopyStats> {
        if !checkpoint.is_dir() {
            return Err(HarnessError::CheckpointMissing {
                path: checkpoint.to_path_buf(),
            });
        }

        let failed = |source: io::Error| HarnessError::RestoreFailed {
            checkpoint: checkpoint.to_path_buf(),
            target: target.to_path_buf(),
            source,
        };

        if fs::symlink_metadata(target).is_ok() {
            debug!("Removing {}", target.display());
            remove_path(target).map_err(failed)?;
        }

        info!("Restoring {} -> {}", checkpoint.display(), target.display());
        let stats = copy_tree(checkpoint, target).map_err(failed)?;
        restrict_data_dir(target).map_err(failed)?;
        info!("Restored {} files ({} bytes)", stats.files, stats.bytes);
        Ok(stats)
    }

    /// Copy a stopped data directory to `checkpoint`, replacing any previous one.
    ///
    /// The copy goes to `<checkpoint>.partial` first and is renamed into place,
    /// so an interrupted save never leaves a half-written checkpoint behind.
    pub fn save(
        &self,
        source: &Path,
        checkpoint: &Path,
        scale_factor: Option<f64>,
    ) -> Result<CheckpointMeta> {
        let refuse = |reason: String| HarnessError::SaveFailed {
            source_dir: source.to_path_buf(),
            checkpoint: checkpoint.to_path_buf(),
            reason,
        };

        if !source.is_dir() {
            return Err(refuse("data directory does not exist".to_string()));
        }
        if source.join(POSTMASTER_PID).exists() {
            return Err(refuse(format!(
                "{} is present, the server is still running",
                POSTMASTER_PID
            )));
        }

        let partial = sibling(checkpoint, PARTIAL_SUFFIX).ok_or_else(|| {
            refuse("checkpoint path has no file name".to_string())
        })?;
        let meta_path = meta_path(checkpoint).ok_or_else(|| {
            refuse("checkpoint path has no file name".to_string())
        })?;

        if let Some(parent) = checkpoint.parent() {
            fs::create_dir_all(parent).map_err(|e| refuse(e.to_string()))?;
        }
        if fs::symlink_metadata(&partial).is_ok() {
            warn!("Discarding leftover {}", partial.display());
            remove_path(&partial).map_err(|e| refuse(e.to_string()))?;
        }

        info!("Saving {} -> {}", source.display(), checkpoint.display());
        let stats = copy_tree(source, &partial)
            .map_err(|e| refuse(format!("copy failed: {}", e)))?;

        if fs::symlink_metadata(checkpoint).is_ok() {
            debug!("Replacing previous checkpoint {}", checkpoint.display());
            remove_path(checkpoint).map_err(|e| refuse(e.to_string()))?;
        }
        fs::rename(&partial, checkpoint).map_err(|e| refuse(format!("rename failed: {}", e)))?;

        let meta = CheckpointMeta {
            created_at: Utc::now(),
            source: source.to_path_buf(),
            files: stats.files,
            bytes: stats.bytes,
            scale_factor,
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        fs::write(&meta_path, json).map_err(|e| HarnessError::io(&meta_path, e))?;

        info!("Saved checkpoint: {} files ({} bytes)", stats.files, stats.bytes);
        Ok(meta)
    }

    /// Report whether a checkpoint exists and what its sidecar says.
    pub fn inspect(&self, checkpoint: &Path) -> Result<CheckpointInfo> {
        let exists = checkpoint.is_dir();
        let meta = match meta_path(checkpoint) {
            Some(path) if exists && path.is_file() => {
                let bytes = fs::read(&path).map_err(|e| HarnessError::io(&path, e))?;
                match serde_json::from_slice(&bytes) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!("Ignoring unreadable {}: {}", path.display(), e);
                        None
                    }
                }
            }
            _ => None,
        };
        Ok(CheckpointInfo {
            path: checkpoint.to_path_buf(),
            exists,
            meta,
        })
    }
}

/// `<checkpoint>.meta.json`
pub fn meta_path(checkpoint: &Path) -> Option<PathBuf> {
    sibling(checkpoint, META_SUFFIX)
}

fn sibling(path: &Path, suffix: &str) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(suffix);
    Some(path.with_file_name(name))
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursive copy keeping permissions and symlinks (links are not followed).
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut dir_permissions = Vec::new();

    fs::create_dir_all(dst)?;
    dir_permissions.push((dst.to_path_buf(), fs::metadata(src)?.permissions()));

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            dir_permissions.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            stats.bytes += fs::copy(entry.path(), &target)?;
            stats.files += 1;
        }
    }

    // Deepest first, so read-only directories are sealed after their contents.
    for (dir, permissions) in dir_permissions.into_iter().rev() {
        fs::set_permissions(&dir, permissions)?;
    }
    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let destination = fs::read_link(link)?;
    std::os::unix::fs::symlink(destination, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

#[cfg(unix)]
fn restrict_data_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_data_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
