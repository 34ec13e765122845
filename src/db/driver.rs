//! Driver adapter seam.
//!
//! The pooling, scope and migration layers only talk to the database through these
//! traits. [`crate::db::backend`] implements them on top of sqlx; tests provide an
//! in-memory implementation.

use crate::error::DbResult;
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// One physical connection checked out of a native pool.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Report whether the connection has been closed underneath us.
    async fn is_closed(&mut self) -> bool;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Execute the same statement once per argument list.
    async fn execute_many(&mut self, sql: &str, batches: &[Vec<QueryParam>]) -> DbResult<()>;

    /// Execute a script that may contain several statements, without parameters.
    async fn execute_script(&mut self, sql: &str) -> DbResult<()>;

    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    async fn fetch_row(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>>;

    /// Fetch a single value from the first row, `None` if no row was returned.
    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        column: usize,
    ) -> DbResult<Option<JsonValue>>;
}

/// A native connection pool.
#[async_trait]
pub trait DriverPool: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Check out the next available connection, waiting at most `timeout`.
    async fn acquire(&self, timeout: Option<Duration>) -> DbResult<Self::Connection>;

    /// Hand a connection back to the native pool.
    async fn release(&self, conn: Self::Connection);

    async fn close(&self);
}

/// Something that can open a fresh native pool, e.g. a parsed pool configuration.
#[async_trait]
pub trait PoolConnector: Send + Sync + 'static {
    type Pool: DriverPool;

    async fn connect(&self) -> DbResult<Self::Pool>;
}
