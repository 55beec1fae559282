//! Against a running PostgreSQL. See `tpch_harness_test_utils::live`.
#![cfg(feature = "pg-tests")]

use chrono::Utc;
use tempfile::TempDir;
use tpch_harness::process::{await_ready, PgReadinessProbe};
use tpch_harness::{
    resolve, ConfigLayer, EnvSnapshot, ItemStatus, ReadinessPolicy, ResolveContext, Secret,
    WarmupPasses, WorkloadDriver, WorkloadMode, WorkloadRunner,
};
use tpch_harness_test_utils::live::LivePgSettings;
use tpch_harness_test_utils::write_tree;

#[tokio::test]
async fn readiness_probe_accepts_live_server() {
    let pg = LivePgSettings::from_env();
    let probe = PgReadinessProbe::new(&pg.host, pg.port, &pg.user, Secret::new(&pg.password));

    let attempt = await_ready(&probe, &ReadinessPolicy::default()).await.unwrap();

    assert_eq!(attempt, 1);
}

#[tokio::test]
async fn benchmark_against_live_server() {
    let pg = LivePgSettings::from_env();
    let root = TempDir::new().unwrap();
    write_tree(
        &root.path().join("queries"),
        &[
            ("1.sql", "select generate_series(1, 5);\n"),
            ("2.sql", "select * from no_such_relation;\n"),
        ],
    )
    .unwrap();

    let ctx = ResolveContext {
        cwd: root.path().to_path_buf(),
        home: root.path().to_path_buf(),
        now: Utc::now(),
        pg_ctl_on_path: Some(root.path().join("bin").join("pg_ctl")),
    };
    let cli = ConfigLayer {
        host: Some(pg.host.clone()),
        port: Some(pg.port),
        database: Some(pg.database.clone()),
        user: Some(pg.user.clone()),
        password: Some(Secret::new(&pg.password)),
        warmup: Some(WarmupPasses::Iterations(1)),
        ..Default::default()
    };
    let env = ConfigLayer::from_env(&EnvSnapshot::default()).unwrap();
    let config = resolve(ConfigLayer::defaults(&ctx), env, cli, &ctx).unwrap();

    let result = WorkloadRunner::postgres(&config)
        .run(&config, WorkloadMode::Benchmark)
        .await
        .unwrap();

    assert_eq!(result.items.len(), 2);
    assert_eq!(result.items[0].status, ItemStatus::Succeeded);
    assert_eq!(result.items[0].rows, 5);
    assert!(matches!(result.items[1].status, ItemStatus::Failed { .. }));
}
