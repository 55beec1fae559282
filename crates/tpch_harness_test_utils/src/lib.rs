//! Test utilities for the TPC-H harness.
//!
//! - [`tree`]: build directory fixtures and snapshot them for byte-level comparison
//! - [`listener`]: a TCP endpoint that starts accepting only after a delay
//! - [`live`]: connection settings for tests against a real PostgreSQL
//!   (used by the `pg-tests` feature of `tpch_harness`)
//!
//! # Usage
//!
//! ```rust,ignore
//! use tpch_harness_test_utils::{snapshot_tree, write_tree};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! write_tree(dir.path(), &[("base/1/1259", "heap"), ("PG_VERSION", "16\n")]).unwrap();
//! let before = snapshot_tree(dir.path()).unwrap();
//! ```

pub mod listener;
pub mod live;
pub mod tree;

pub use listener::DelayedListener;
pub use tree::{snapshot_tree, write_tree, TreeSnapshot};
