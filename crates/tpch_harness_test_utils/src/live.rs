//! Settings for tests that talk to a real PostgreSQL.
//!
//! Run with:
//!   TPCH_TEST_PG_PORT=5432 TPCH_TEST_PG_USER=postgres \
//!   cargo test -p tpch_harness --features pg-tests

use std::env;

/// Connection settings read from `TPCH_TEST_PG_*`.
#[derive(Debug, Clone)]
pub struct LivePgSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl LivePgSettings {
    /// Read settings from the environment, falling back to a local default cluster.
    pub fn from_env() -> Self {
        Self {
            host: env::var("TPCH_TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("TPCH_TEST_PG_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: env::var("TPCH_TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
            user: env::var("TPCH_TEST_PG_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("TPCH_TEST_PG_PASSWORD").unwrap_or_default(),
        }
    }
}
