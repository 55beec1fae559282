//! Schema creation and bulk load of generated TPC-H data.
//!
//! Constraints and indexes are created only after every table is loaded.

use crate::config::{Config, Secret};
use crate::dbgen::{table_file, TABLES};
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

const MAINTENANCE_DATABASE: &str = "postgres";
const COPY_CHUNK_BYTES: usize = 1 << 20;

const SCHEMA_SQL: &str = r#"
CREATE TABLE region (
    r_regionkey  INTEGER NOT NULL,
    r_name       CHAR(25) NOT NULL,
    r_comment    VARCHAR(152)
);
CREATE TABLE nation (
    n_nationkey  INTEGER NOT NULL,
    n_name       CHAR(25) NOT NULL,
    n_regionkey  INTEGER NOT NULL,
    n_comment    VARCHAR(152)
);
CREATE TABLE customer (
    c_custkey    INTEGER NOT NULL,
    c_name       VARCHAR(25) NOT NULL,
    c_address    VARCHAR(40) NOT NULL,
    c_nationkey  INTEGER NOT NULL,
    c_phone      CHAR(15) NOT NULL,
    c_acctbal    DECIMAL(15,2) NOT NULL,
    c_mktsegment CHAR(10) NOT NULL,
    c_comment    VARCHAR(117) NOT NULL
);
CREATE TABLE supplier (
    s_suppkey    INTEGER NOT NULL,
    s_name       CHAR(25) NOT NULL,
    s_address    VARCHAR(40) NOT NULL,
    s_nationkey  INTEGER NOT NULL,
    s_phone      CHAR(15) NOT NULL,
    s_acctbal    DECIMAL(15,2) NOT NULL,
    s_comment    VARCHAR(101) NOT NULL
);
CREATE TABLE part (
    p_partkey     INTEGER NOT NULL,
    p_name        VARCHAR(55) NOT NULL,
    p_mfgr        CHAR(25) NOT NULL,
    p_brand       CHAR(10) NOT NULL,
    p_type        VARCHAR(25) NOT NULL,
    p_size        INTEGER NOT NULL,
    p_container   CHAR(10) NOT NULL,
    p_retailprice DECIMAL(15,2) NOT NULL,
    p_comment     VARCHAR(23) NOT NULL
);
CREATE TABLE partsupp (
    ps_partkey    INTEGER NOT NULL,
    ps_suppkey    INTEGER NOT NULL,
    ps_availqty   INTEGER NOT NULL,
    ps_supplycost DECIMAL(15,2) NOT NULL,
    ps_comment    VARCHAR(199) NOT NULL
);
CREATE TABLE orders (
    o_orderkey      INTEGER NOT NULL,
    o_custkey       INTEGER NOT NULL,
    o_orderstatus   CHAR(1) NOT NULL,
    o_totalprice    DECIMAL(15,2) NOT NULL,
    o_orderdate     DATE NOT NULL,
    o_orderpriority CHAR(15) NOT NULL,
    o_clerk         CHAR(15) NOT NULL,
    o_shippriority  INTEGER NOT NULL,
    o_comment       VARCHAR(79) NOT NULL
);
CREATE TABLE lineitem (
    l_orderkey      INTEGER NOT NULL,
    l_partkey       INTEGER NOT NULL,
    l_suppkey       INTEGER NOT NULL,
    l_linenumber    INTEGER NOT NULL,
    l_quantity      DECIMAL(15,2) NOT NULL,
    l_extendedprice DECIMAL(15,2) NOT NULL,
    l_discount      DECIMAL(15,2) NOT NULL,
    l_tax           DECIMAL(15,2) NOT NULL,
    l_returnflag    CHAR(1) NOT NULL,
    l_linestatus    CHAR(1) NOT NULL,
    l_shipdate      DATE NOT NULL,
    l_commitdate    DATE NOT NULL,
    l_receiptdate   DATE NOT NULL,
    l_shipinstruct  CHAR(25) NOT NULL,
    l_shipmode      CHAR(10) NOT NULL,
    l_comment       VARCHAR(44) NOT NULL
);
"#;

const PRIMARY_KEYS_SQL: &str = r#"
ALTER TABLE region   ADD PRIMARY KEY (r_regionkey);
ALTER TABLE nation   ADD PRIMARY KEY (n_nationkey);
ALTER TABLE customer ADD PRIMARY KEY (c_custkey);
ALTER TABLE supplier ADD PRIMARY KEY (s_suppkey);
ALTER TABLE part     ADD PRIMARY KEY (p_partkey);
ALTER TABLE partsupp ADD PRIMARY KEY (ps_partkey, ps_suppkey);
ALTER TABLE orders   ADD PRIMARY KEY (o_orderkey);
ALTER TABLE lineitem ADD PRIMARY KEY (l_orderkey, l_linenumber);
"#;

const FOREIGN_KEYS_SQL: &str = r#"
ALTER TABLE nation   ADD FOREIGN KEY (n_regionkey) REFERENCES region (r_regionkey);
ALTER TABLE customer ADD FOREIGN KEY (c_nationkey) REFERENCES nation (n_nationkey);
ALTER TABLE supplier ADD FOREIGN KEY (s_nationkey) REFERENCES nation (n_nationkey);
ALTER TABLE partsupp ADD FOREIGN KEY (ps_partkey) REFERENCES part (p_partkey);
ALTER TABLE partsupp ADD FOREIGN KEY (ps_suppkey) REFERENCES supplier (s_suppkey);
ALTER TABLE orders   ADD FOREIGN KEY (o_custkey) REFERENCES customer (c_custkey);
ALTER TABLE lineitem ADD FOREIGN KEY (l_orderkey) REFERENCES orders (o_orderkey);
ALTER TABLE lineitem ADD FOREIGN KEY (l_partkey, l_suppkey) REFERENCES partsupp (ps_partkey, ps_suppkey);
"#;

const INDEXES_SQL: &str = r#"
CREATE INDEX idx_lineitem_shipdate ON lineitem (l_shipdate);
CREATE INDEX idx_lineitem_part_supp ON lineitem (l_partkey, l_suppkey);
CREATE INDEX idx_orders_orderdate ON orders (o_orderdate);
CREATE INDEX idx_orders_custkey ON orders (o_custkey);
CREATE INDEX idx_customer_nationkey ON customer (c_nationkey);
CREATE INDEX idx_supplier_nationkey ON supplier (s_nationkey);
CREATE INDEX idx_partsupp_suppkey ON partsupp (ps_suppkey);
"#;

/// Rows and time for one loaded table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLoad {
    pub table: String,
    pub rows: u64,
    pub elapsed: Duration,
}

/// Database-side setup steps, in the order setup calls them.
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Create the benchmark database and set the role credential.
    async fn create_database(&self) -> Result<()>;

    /// Create tables and bulk load every `<table>.tbl` from `data_dir`.
    async fn load_tables(&self, data_dir: &Path) -> Result<Vec<TableLoad>>;

    /// Primary keys, foreign keys, secondary indexes.
    async fn create_constraints(&self) -> Result<()>;

    async fn analyze(&self) -> Result<()>;
}

/// `DataLoader` over sqlx.
pub struct PgLoader {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: Secret,
}

impl PgLoader {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(database)
            .username(&self.user)
            .application_name("tpch-harness")
            .disable_statement_logging();
        if !self.password.is_empty() {
            options = options.password(self.password.expose());
        }
        PgConnection::connect_with(&options)
            .await
            .map_err(|e| {
                HarnessError::database(
                    format!("connect to {}:{}/{}", self.host, self.port, database),
                    e,
                )
            })
    }

    async fn run_script(&self, operation: &str, sql: &str) -> Result<()> {
        let started = Instant::now();
        let mut conn = self.connect(&self.database).await?;
        Executor::execute(&mut conn,
            sqlx::raw_sql(sql))
            .await
            .map_err(|e| HarnessError::database(operation, e))?;
        let _ = conn.close().await;
        info!("{} done in {:.1}s", operation, started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[async_trait]
impl DataLoader for PgLoader {
    async fn create_database(&self) -> Result<()> {
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;

        let exists = sqlx::query("SELECT 1 AS present FROM pg_database WHERE datname = $1")
            .bind(&self.database)
            .fetch_optional(&mut conn)
            .await
            .map_err(|e| HarnessError::database("check database", e))?
            .map(|row| row.get::<i32, _>("present") == 1)
            .unwrap_or(false);

        if exists {
            info!("Database {} already exists", self.database);
        } else {
            info!("Creating database {}", self.database);
            Executor::execute(&mut conn,
                sqlx::raw_sql(&format!("CREATE DATABASE {}", quote_ident(&self.database))))
                .await
                .map_err(|e| HarnessError::database("create database", e))?;
        }

        if !self.password.is_empty() {
            debug!("Setting password for role {}", self.user);
            let statement = format!(
                "ALTER ROLE {} WITH PASSWORD {}",
                quote_ident(&self.user),
                quote_literal(self.password.expose())
            );
            Executor::execute(&mut conn,
                sqlx::raw_sql(&statement))
                .await
                .map_err(|e| HarnessError::database("set role password", e))?;
        }

        let _ = conn.close().await;
        Ok(())
    }

    async fn load_tables(&self, data_dir: &Path) -> Result<Vec<TableLoad>> {
        let mut conn = self.connect(&self.database).await?;
        Executor::execute(&mut conn,
            sqlx::raw_sql(SCHEMA_SQL))
            .await
            .map_err(|e| HarnessError::database("create tables", e))?;

        let mut loads = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let path = table_file(data_dir, table);
            let started = Instant::now();
            let rows = copy_table(&mut conn, table, &path).await?;
            let elapsed = started.elapsed();
            info!("Loaded {} rows into {} in {:.1}s", rows, table, elapsed.as_secs_f64());
            loads.push(TableLoad {
                table: table.to_string(),
                rows,
                elapsed,
            });
        }

        let _ = conn.close().await;
        Ok(loads)
    }

    async fn create_constraints(&self) -> Result<()> {
        self.run_script("primary keys", PRIMARY_KEYS_SQL).await?;
        self.run_script("foreign keys", FOREIGN_KEYS_SQL).await?;
        self.run_script("indexes", INDEXES_SQL).await
    }

    async fn analyze(&self) -> Result<()> {
        self.run_script("analyze", "ANALYZE").await
    }
}

async fn copy_table(conn: &mut PgConnection, table: &str, path: &Path) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| HarnessError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let statement = format!("COPY {} FROM STDIN (FORMAT csv, DELIMITER '|')", table);
    let mut copy = conn
        .copy_in_raw(&statement)
        .await
        .map_err(|e| HarnessError::database(format!("copy {}", table), e))?;

    let mut line = Vec::new();
    let mut chunk = Vec::with_capacity(COPY_CHUNK_BYTES);
    loop {
        line.clear();
        let read = match reader.read_until(b'\n', &mut line).await {
            Ok(n) => n,
            Err(e) => {
                let _ = copy.abort(format!("read error: {}", e)).await;
                return Err(HarnessError::io(path, e));
            }
        };
        if read == 0 {
            break;
        }
        chunk.extend_from_slice(strip_trailing_delimiter(&line));
        chunk.push(b'\n');

        if chunk.len() >= COPY_CHUNK_BYTES {
            copy.send(std::mem::take(&mut chunk))
                .await
                .map_err(|e| HarnessError::database(format!("copy {}", table), e))?;
            chunk.reserve(COPY_CHUNK_BYTES);
        }
    }
    if !chunk.is_empty() {
        copy.send(chunk)
            .await
            .map_err(|e| HarnessError::database(format!("copy {}", table), e))?;
    }

    copy.finish()
        .await
        .map_err(|e| HarnessError::database(format!("copy {}", table), e))
}

/// `1|AFRICA|comment|\n` -> `1|AFRICA|comment`
pub fn strip_trailing_delimiter(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'|' {
        end -= 1;
    }
    &line[..end]
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
