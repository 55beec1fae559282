use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use tpch_harness::config::env_keys;

fn harness_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tpch-harness"))
}

/// Runs the binary with a clean harness environment rooted at `home`.
fn run_cli(home: &Path, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(harness_bin());
    cmd.args(args);
    for key in env_keys::ALL {
        cmd.env_remove(key);
    }
    cmd.env("TPCH_HARNESS_HOME", home);
    cmd.env(env_keys::PG_BIN, home.join("bin"));
    cmd.current_dir(home);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output().expect("failed to execute tpch-harness")
}

fn parse_json_output(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let json_start = stdout.find('{').unwrap_or_else(|| {
        panic!(
            "no JSON payload found in output\nstdout:\n{}\nstderr:\n{}",
            stdout,
            String::from_utf8_lossy(&output.stderr)
        )
    });
    let mut deserializer = serde_json::Deserializer::from_str(&stdout[json_start..]);
    serde_json::Value::deserialize(&mut deserializer).unwrap_or_else(|err| {
        panic!(
            "failed to parse JSON output: {}\nstdout:\n{}\nstderr:\n{}",
            err,
            stdout,
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn help_exits_zero() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["--help"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("setup"));
    assert!(stdout.contains("run"));
}

#[test]
fn unknown_flag_exits_with_usage_error() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["run", "--no-such-flag"], &[]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--no-such-flag"));
}

#[test]
fn config_json_layers_env_and_flags() {
    let home = TempDir::new().unwrap();
    let output = run_cli(
        home.path(),
        &["config", "--json", "--port", "6001", "--queries", "6,1"],
        &[("PGPORT", "5999"), ("PGDATABASE", "bench")],
    );
    assert!(
        output.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = parse_json_output(&output);

    assert_eq!(json["port"], 6001);
    assert_eq!(json["database"], "bench");
    assert_eq!(json["user"], "postgres");
    assert_eq!(json["queries"], "6,1");
    assert_eq!(
        json["data_dir"].as_str().unwrap(),
        home.path().join("pgdata").to_str().unwrap()
    );
    assert_eq!(
        json["query_dir"].as_str().unwrap(),
        home.path().join("queries").to_str().unwrap()
    );
}

#[test]
fn config_json_never_prints_password() {
    let home = TempDir::new().unwrap();
    let output = run_cli(
        home.path(),
        &["config", "--json"],
        &[("PGPASSWORD", "hunter2-secret")],
    );
    assert!(output.status.success());
    let json = parse_json_output(&output);
    assert_eq!(json["password"], "***");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stdout.contains("hunter2-secret"));
    assert!(!stderr.contains("hunter2-secret"));

    let logs = home.path().join("logs");
    if logs.is_dir() {
        for entry in fs::read_dir(&logs).unwrap() {
            let text = fs::read_to_string(entry.unwrap().path()).unwrap_or_default();
            assert!(!text.contains("hunter2-secret"));
        }
    }
}

#[test]
fn invalid_env_value_is_reported() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["config", "--json"], &[("PGPORT", "fifty")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: Invalid configuration"));
    assert!(stderr.contains("PGPORT"));
}

#[test]
fn run_without_checkpoint_fails_before_touching_data_dir() {
    let home = TempDir::new().unwrap();
    let queries = home.path().join("queries");
    fs::create_dir_all(&queries).unwrap();
    fs::write(queries.join("1.sql"), "select 1;\n").unwrap();
    let data_dir = home.path().join("pgdata");
    fs::create_dir_all(&data_dir).unwrap();
    fs::write(data_dir.join("PG_VERSION"), "16\n").unwrap();

    let output = run_cli(home.path(), &["run"], &[]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: Checkpoint not found"));
    assert!(stderr.contains("tpch-harness setup"));
    assert_eq!(fs::read_to_string(data_dir.join("PG_VERSION")).unwrap(), "16\n");
}

#[test]
fn workload_refuses_an_existing_result() {
    let home = TempDir::new().unwrap();
    let queries = home.path().join("queries");
    fs::create_dir_all(&queries).unwrap();
    fs::write(queries.join("1.sql"), "select 1;\n").unwrap();
    let results = home.path().join("results");
    fs::create_dir_all(&results).unwrap();
    fs::write(results.join("r1.json"), "{\"kept\": true}").unwrap();

    let output = run_cli(home.path(), &["workload", "--run-id", "r1"], &[]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: Invalid configuration"), "stderr:\n{}", stderr);
    assert!(stderr.contains("r1.json"));
    assert_eq!(
        fs::read_to_string(results.join("r1.json")).unwrap(),
        "{\"kept\": true}"
    );
}

#[test]
fn unwritable_harness_home_falls_back_to_console_logging() {
    let home = TempDir::new().unwrap();
    let blocked = home.path().join("not-a-dir");
    fs::write(&blocked, "occupied").unwrap();

    let output = run_cli(
        home.path(),
        &["config", "--json"],
        &[("TPCH_HARNESS_HOME", blocked.to_str().unwrap())],
    );

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("file logging disabled"), "stderr:\n{}", stderr);
    assert!(!stderr.contains("failed to initialize logging"));
    assert_eq!(fs::read_to_string(&blocked).unwrap(), "occupied");
}
