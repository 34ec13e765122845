//! Resilient database access for long-running services.
//!
//! This library provides a connection pool that survives silently dropped idle
//! connections, scoped transactions with post-commit callbacks, and a sequential
//! schema-migration runner shared by cooperating processes (PostgreSQL, SQLite).

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;

pub use bootstrap::{Bootstrap, MigrationRole};
pub use config::{Config, PoolConfig, TlsPolicy};
pub use db::{PoolRegistry, ResilientPool, TransactionScope};
pub use error::{DbError, DbResult};
