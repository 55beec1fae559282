//! Benchmark and warmup passes over fake sessions.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tpch_harness::workload::{
    MemoryProbe, QuerySession, SessionFactory, WarmupStopReason,
};
use tpch_harness::{
    resolve, Config, ConfigLayer, EnvSnapshot, HarnessError, ItemStatus, ResolveContext, Result,
    WarmupPasses, WorkloadDriver, WorkloadMode, WorkloadRunner, WorkloadSelection,
};
use tpch_harness_test_utils::write_tree;

const ROWS: u64 = 7;

#[derive(Default)]
struct Server {
    connects: u32,
    executed: Vec<String>,
}

type Shared = Arc<Mutex<Server>>;

/// Sessions whose statements fail when they contain `fail_on`.
struct FakeSessions {
    server: Shared,
    refuse: bool,
    fail_on: Vec<&'static str>,
}

struct FakeSession {
    server: Shared,
    fail_on: Vec<&'static str>,
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn connect(&self) -> Result<Box<dyn QuerySession>> {
        if self.refuse {
            return Err(HarnessError::WorkloadConnect {
                endpoint: "localhost:5432/tpch".into(),
                reason: "connection refused".into(),
            });
        }
        self.server.lock().unwrap().connects += 1;
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
            fail_on: self.fail_on.clone(),
        }))
    }
}

#[async_trait]
impl QuerySession for FakeSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.server.lock().unwrap().executed.push(sql.trim().to_string());
        if self.fail_on.iter().any(|needle| sql.contains(needle)) {
            return Err(HarnessError::Command {
                program: "query".into(),
                detail: format!("relation does not exist ({})", sql.trim()),
            });
        }
        Ok(ROWS)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Replays samples in order, then fails.
struct ScriptedMemory(Mutex<VecDeque<f64>>);

impl ScriptedMemory {
    fn new(samples: &[f64]) -> Self {
        Self(Mutex::new(samples.iter().copied().collect()))
    }
}

#[async_trait]
impl MemoryProbe for ScriptedMemory {
    async fn sample_gb(&self) -> Result<f64> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HarnessError::Command {
                program: "ps".into(),
                detail: "no postgres processes".into(),
            })
    }
}

struct Fixture {
    _root: TempDir,
    config: Config,
    server: Shared,
}

impl Fixture {
    fn new(cli: ConfigLayer) -> Self {
        let root = TempDir::new().unwrap();
        write_tree(
            &root.path().join("queries"),
            &[
                ("1.sql", "-- pricing summary\nselect 'q1';\n"),
                ("2.sql", "select 'q2';\n"),
                ("6.sql", "select 'q6' where 1 = :1;\n"),
                ("10.sql", "select 'q10';\n"),
                ("README.md", "not a query"),
            ],
        )
        .unwrap();
        let config = config_in(root.path(), cli);
        Self {
            _root: root,
            config,
            server: Shared::default(),
        }
    }

    fn runner(&self, fail_on: &[&'static str], memory: &[f64]) -> WorkloadRunner {
        WorkloadRunner::new(
            Box::new(FakeSessions {
                server: self.server.clone(),
                refuse: false,
                fail_on: fail_on.to_vec(),
            }),
            Box::new(ScriptedMemory::new(memory)),
        )
    }

    fn executed(&self) -> Vec<String> {
        self.server.lock().unwrap().executed.clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.executed().iter().filter(|sql| sql.contains(needle)).count()
    }
}

fn config_in(root: &Path, cli: ConfigLayer) -> Config {
    let ctx = ResolveContext {
        cwd: root.to_path_buf(),
        home: root.to_path_buf(),
        now: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        pg_ctl_on_path: Some(root.join("bin").join("pg_ctl")),
    };
    let env = ConfigLayer::from_env(&EnvSnapshot::default()).unwrap();
    resolve(ConfigLayer::defaults(&ctx), env, cli, &ctx).unwrap()
}

fn items(raw: &str) -> Option<WorkloadSelection> {
    Some(WorkloadSelection::parse(raw).unwrap())
}

#[tokio::test]
async fn selected_items_get_warmup_passes_then_one_measurement() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("1,6"),
        warmup: Some(WarmupPasses::Iterations(2)),
        ..Default::default()
    });

    let result = fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "6"]);
    assert_eq!(fixture.count("'q1'"), 3);
    assert_eq!(fixture.count("'q6'"), 3);
    assert_eq!(fixture.count("'q2'"), 0);
    assert!(result.success);
    for item in &result.items {
        assert_eq!(item.status, ItemStatus::Succeeded);
        assert_eq!(item.warmup_passes, 2);
        assert_eq!(item.rows, ROWS);
    }
    assert_eq!(result.output_path, fixture.config.result_path());
}

#[tokio::test]
async fn templates_are_prepared_before_execution() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("6"),
        ..Default::default()
    });

    fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    assert_eq!(fixture.executed(), vec!["select 'q6' where 1 = 90;"]);
}

#[tokio::test]
async fn skip_warmup_runs_everything_once_in_id_order() {
    let fixture = Fixture::new(ConfigLayer {
        warmup: Some(WarmupPasses::Skip),
        ..Default::default()
    });

    let result = fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "6", "10"]);
    assert_eq!(fixture.executed().len(), 4);
    assert!(result.items.iter().all(|i| i.warmup_passes == 0));
}

#[tokio::test]
async fn failed_item_is_recorded_and_siblings_continue() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("1,2,6"),
        ..Default::default()
    });

    let result = fixture
        .runner(&["'q2'"], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_items(), 1);
    match &result.items[1].status {
        ItemStatus::Failed { error } => assert!(error.contains("relation does not exist")),
        other => panic!("expected item 2 to fail, got {:?}", other),
    }
    assert_eq!(result.items[0].status, ItemStatus::Succeeded);
    assert_eq!(result.items[2].status, ItemStatus::Succeeded);
}

#[tokio::test]
async fn unknown_items_are_rejected_up_front() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("1,23,99"),
        ..Default::default()
    });

    let err = fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidConfig(_)));
    let message = err.to_string();
    assert!(message.contains("23"));
    assert!(message.contains("99"));
    assert!(fixture.executed().is_empty());
}

#[tokio::test]
async fn connection_failure_is_fatal() {
    let fixture = Fixture::new(ConfigLayer::default());
    let runner = WorkloadRunner::new(
        Box::new(FakeSessions {
            server: fixture.server.clone(),
            refuse: true,
            fail_on: Vec::new(),
        }),
        Box::new(ScriptedMemory::new(&[])),
    );

    let err = runner
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::WorkloadConnect { .. }));
}

#[tokio::test]
async fn hooks_wrap_items_on_one_session() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("1"),
        before_sql: Some(vec!["SET work_mem = '1GB'".into()]),
        after_sql: Some(vec!["RESET work_mem".into()]),
        ..Default::default()
    });

    let result = fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        fixture.executed(),
        vec!["SET work_mem = '1GB'", "select 'q1';", "RESET work_mem"]
    );
    assert_eq!(fixture.server.lock().unwrap().connects, 1);
}

#[tokio::test]
async fn failing_before_hook_aborts_the_run() {
    let fixture = Fixture::new(ConfigLayer {
        before_sql: Some(vec!["SET no_such_setting = 1".into()]),
        ..Default::default()
    });

    let err = fixture
        .runner(&["no_such_setting"], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap_err();

    match err {
        HarnessError::WorkloadHook { sql, .. } => assert_eq!(sql, "SET no_such_setting = 1"),
        other => panic!("expected WorkloadHook, got {:?}", other),
    }
    assert_eq!(fixture.executed().len(), 1);
}

#[tokio::test]
async fn failing_after_hook_keeps_results() {
    let fixture = Fixture::new(ConfigLayer {
        queries: items("1,6"),
        after_sql: Some(vec!["SELECT pg_stat_reset_broken()".into()]),
        ..Default::default()
    });

    let result = fixture
        .runner(&["pg_stat_reset_broken"], &[])
        .run(&fixture.config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    assert_eq!(result.items.len(), 2);
    assert_eq!(result.failed_items(), 0);
    assert_eq!(result.hook_errors.len(), 1);
    assert!(!result.success);
}

#[tokio::test]
async fn warmup_stops_once_memory_target_is_reached() {
    let fixture = Fixture::new(ConfigLayer {
        target_memory_gb: Some(128.0),
        warmup_rounds: Some(3),
        warmup_queries: items("1,6"),
        ..Default::default()
    });

    // Initial sample, then one per round.
    let result = fixture
        .runner(&[], &[12.0, 70.5, 131.0, 140.0])
        .run(&fixture.config, WorkloadMode::Warmup)
        .await
        .unwrap();

    let summary = result.warmup.as_ref().unwrap();
    assert_eq!(summary.stop_reason, WarmupStopReason::TargetReached);
    assert_eq!(summary.rounds.len(), 2);
    assert_eq!(summary.rounds[1].memory_gb, Some(131.0));
    assert_eq!(fixture.count("'q1'"), 2);
    assert_eq!(fixture.count("'q2'"), 0);
    assert_eq!(result.mode, WorkloadMode::Warmup);
    assert_eq!(result.output_path, fixture.config.warmup_result_path());
}

#[tokio::test]
async fn warmup_runs_every_round_below_target() {
    let fixture = Fixture::new(ConfigLayer {
        target_memory_gb: Some(128.0),
        warmup_rounds: Some(3),
        ..Default::default()
    });

    let result = fixture
        .runner(&[], &[1.0, 2.0, 3.0, 4.0])
        .run(&fixture.config, WorkloadMode::Warmup)
        .await
        .unwrap();

    let summary = result.warmup.as_ref().unwrap();
    assert_eq!(summary.stop_reason, WarmupStopReason::RoundsExhausted);
    assert_eq!(summary.rounds.len(), 3);
    assert!(summary.rounds.iter().all(|r| r.items.len() == 4));
    assert_eq!(fixture.executed().len(), 12);
    assert!(result.success);
}

#[tokio::test]
async fn warmup_without_memory_samples_still_completes() {
    let fixture = Fixture::new(ConfigLayer {
        warmup_rounds: Some(2),
        warmup_queries: items("10"),
        ..Default::default()
    });

    let result = fixture
        .runner(&[], &[])
        .run(&fixture.config, WorkloadMode::Warmup)
        .await
        .unwrap();

    let summary = result.warmup.as_ref().unwrap();
    assert_eq!(summary.rounds.len(), 2);
    assert!(summary.rounds.iter().all(|r| r.memory_gb.is_none()));
    assert_eq!(summary.stop_reason, WarmupStopReason::RoundsExhausted);
}
