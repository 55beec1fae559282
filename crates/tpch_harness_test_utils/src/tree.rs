//! Directory-tree fixtures.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Relative path -> file bytes. Directories appear with an empty `None` entry
/// so that empty directories take part in comparisons.
pub type TreeSnapshot = BTreeMap<String, Option<Vec<u8>>>;

/// Create every `(relative_path, contents)` under `root`, making parents as needed.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) -> Result<()> {
    for (relative, contents) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Read the whole tree under `root` into memory.
pub fn snapshot_tree(root: &Path) -> Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", entry.path().display(), root.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        if entry.file_type().is_dir() {
            snapshot.insert(relative, None);
        } else {
            let bytes = fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            snapshot.insert(relative, Some(bytes));
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_includes_empty_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        write_tree(dir.path(), &[("a/b.txt", "x")]).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let snapshot = snapshot_tree(dir.path()).unwrap();
        assert_eq!(snapshot.get("a/b.txt"), Some(&Some(b"x".to_vec())));
        assert_eq!(snapshot.get("empty"), Some(&None));
        assert_eq!(snapshot.get("a"), Some(&None));
    }
}
