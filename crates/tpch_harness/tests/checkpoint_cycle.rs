//! Save and restore cycles over a realistic data-directory layout.

use std::fs;
use tempfile::TempDir;
use tpch_harness::{CheckpointManager, HarnessError};
use tpch_harness_test_utils::{snapshot_tree, write_tree};

const DATA_DIR: &[(&str, &str)] = &[
    ("PG_VERSION", "16\n"),
    ("postgresql.conf", "shared_buffers = 32GB\n"),
    ("base/1/1259", "catalog heap"),
    ("base/16384/16385", "lineitem heap page"),
    ("base/16384/16385_fsm", "free space map"),
    ("global/pg_control", "control file"),
    ("pg_wal/000000010000000000000001", "wal segment"),
];

#[test]
fn benchmark_writes_never_reach_the_checkpoint() {
    let root = TempDir::new().unwrap();
    let loaded = root.path().join("loaded");
    let checkpoint = root.path().join("checkpoint");
    let data = root.path().join("pgdata");
    write_tree(&loaded, DATA_DIR).unwrap();
    fs::create_dir_all(loaded.join("pg_tblspc")).unwrap();

    let manager = CheckpointManager::new();
    let meta = manager.save(&loaded, &checkpoint, Some(10.0)).unwrap();
    assert_eq!(meta.files, DATA_DIR.len() as u64);
    assert_eq!(meta.scale_factor, Some(10.0));
    let saved = snapshot_tree(&checkpoint).unwrap();
    assert_eq!(saved, snapshot_tree(&loaded).unwrap());

    for run in 0..3 {
        manager.restore(&checkpoint, &data).unwrap();
        assert_eq!(snapshot_tree(&data).unwrap(), saved, "restore {}", run);

        // What a benchmark run leaves behind.
        fs::write(data.join("base/16384/16385"), format!("dirty {}", run)).unwrap();
        fs::write(data.join("postmaster.pid"), "4242\n").unwrap();
        fs::remove_file(data.join("pg_wal/000000010000000000000001")).unwrap();
        fs::create_dir_all(data.join("base/pgsql_tmp")).unwrap();
        fs::write(data.join("base/pgsql_tmp/pgsql_tmp1.0"), "spill").unwrap();

        assert_eq!(snapshot_tree(&checkpoint).unwrap(), saved);
    }
}

#[test]
fn restore_save_restore_round_trip_is_identical() {
    let root = TempDir::new().unwrap();
    let first = root.path().join("first");
    let second = root.path().join("second");
    let data = root.path().join("pgdata");
    let again = root.path().join("pgdata-again");
    write_tree(&first, DATA_DIR).unwrap();
    let original = snapshot_tree(&first).unwrap();

    let manager = CheckpointManager::new();
    manager.restore(&first, &data).unwrap();
    manager.save(&data, &second, None).unwrap();
    manager.restore(&second, &again).unwrap();

    assert_eq!(snapshot_tree(&second).unwrap(), original);
    assert_eq!(snapshot_tree(&again).unwrap(), original);
    let info = manager.inspect(&second).unwrap();
    assert!(info.exists);
    assert_eq!(info.meta.map(|m| m.source), Some(data));
}

#[test]
fn missing_checkpoint_leaves_everything_in_place() {
    let root = TempDir::new().unwrap();
    let data = root.path().join("pgdata");
    write_tree(&data, DATA_DIR).unwrap();
    let before = snapshot_tree(root.path()).unwrap();

    let err = CheckpointManager::new()
        .restore(&root.path().join("never-saved"), &data)
        .unwrap_err();

    assert!(matches!(err, HarnessError::CheckpointMissing { .. }));
    assert_eq!(snapshot_tree(root.path()).unwrap(), before);
}
