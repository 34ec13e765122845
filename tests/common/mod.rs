//! In-memory driver used by the integration tests.
//!
//! Every pool built from the same [`FakeDb`] shares one state: an event log, counters,
//! a scriptable queue of pre-closed connections and acquire errors, and a one-row
//! `database_version` table.

#![allow(dead_code)]

use async_trait::async_trait;
use resilient_db::db::{DriverConnection, DriverPool, PoolConnector};
use resilient_db::error::{DbError, DbResult, SQLSTATE_UNDEFINED_TABLE};
use resilient_db::models::{QueryParam, Row};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted answer to the version query.
#[derive(Debug, Clone)]
pub enum VersionRead {
    Missing,
    Value(i64),
    Error,
}

#[derive(Default)]
struct State {
    /// `None`: table missing. `Some(None)`: table without a row.
    version: Option<Option<i64>>,
    version_reads: VecDeque<VersionRead>,
    closed_queue: VecDeque<bool>,
    always_closed: bool,
    acquire_errors: VecDeque<DbError>,
    failing: HashSet<String>,
    events: Vec<String>,
    acquires: usize,
    releases: usize,
    closed_released: usize,
    pools_closed: usize,
}

#[derive(Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicUsize>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self) -> FakePool {
        FakePool {
            db: self.clone(),
            pool_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_version(&self, version: Option<i64>) {
        self.with(|s| s.version = Some(version));
    }

    pub fn drop_version_table(&self) {
        self.with(|s| s.version = None);
    }

    pub fn version(&self) -> Option<Option<i64>> {
        self.with(|s| s.version)
    }

    pub fn script_version_reads(&self, reads: impl IntoIterator<Item = VersionRead>) {
        self.with(|s| s.version_reads.extend(reads));
    }

    pub fn remaining_version_reads(&self) -> usize {
        self.with(|s| s.version_reads.len())
    }

    /// The next connections handed out report closed (`true`) or live (`false`).
    pub fn queue_closed(&self, closed: impl IntoIterator<Item = bool>) {
        self.with(|s| s.closed_queue.extend(closed));
    }

    pub fn set_always_closed(&self, closed: bool) {
        self.with(|s| s.always_closed = closed);
    }

    pub fn queue_acquire_error(&self, error: DbError) {
        self.with(|s| s.acquire_errors.push_back(error));
    }

    /// Make any statement or script whose text equals `sql` fail.
    pub fn fail_on(&self, sql: &str) {
        self.with(|s| s.failing.insert(sql.trim().to_string()));
    }

    pub fn events(&self) -> Vec<String> {
        self.with(|s| s.events.clone())
    }

    pub fn clear_events(&self) {
        self.with(|s| s.events.clear());
    }

    pub fn acquires(&self) -> usize {
        self.with(|s| s.acquires)
    }

    pub fn releases(&self) -> usize {
        self.with(|s| s.releases)
    }

    pub fn closed_released(&self) -> usize {
        self.with(|s| s.closed_released)
    }

    pub fn pools_closed(&self) -> usize {
        self.with(|s| s.pools_closed)
    }

    fn push(&self, event: impl Into<String>) {
        let event = event.into();
        self.with(|s| s.events.push(event));
    }

    fn check_failure(&self, sql: &str) -> DbResult<()> {
        if self.with(|s| s.failing.contains(sql.trim())) {
            self.push(format!("failed: {}", sql.trim()));
            return Err(DbError::database(
                format!("syntax error in \"{}\"", sql.trim()),
                Some("42601".to_string()),
                "Check the SQL syntax and referenced objects",
            ));
        }
        Ok(())
    }
}

pub struct FakePool {
    db: FakeDb,
    pool_id: usize,
}

impl FakePool {
    pub fn id(&self) -> usize {
        self.pool_id
    }
}

impl std::fmt::Debug for FakePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePool").field("id", &self.pool_id).finish()
    }
}

pub struct FakeConnection {
    db: FakeDb,
    closed: bool,
}

#[async_trait]
impl DriverPool for FakePool {
    type Connection = FakeConnection;

    async fn acquire(&self, timeout: Option<Duration>) -> DbResult<FakeConnection> {
        let _ = timeout;
        let (error, closed) = self.db.with(|s| {
            s.acquires += 1;
            let error = s.acquire_errors.pop_front();
            let closed = s.always_closed || s.closed_queue.pop_front().unwrap_or(false);
            (error, closed)
        });
        if let Some(error) = error {
            return Err(error);
        }
        Ok(FakeConnection {
            db: self.db.clone(),
            closed,
        })
    }

    async fn release(&self, conn: FakeConnection) {
        self.db.with(|s| {
            s.releases += 1;
            if conn.closed {
                s.closed_released += 1;
            }
        });
        self.db.push("release");
    }

    async fn close(&self) {
        self.db.with(|s| s.pools_closed += 1);
        self.db.push(format!("close pool {}", self.pool_id));
    }
}

/// Parse `UPDATE database_version SET version_number = N` out of a script.
fn scripted_version(sql: &str) -> Option<i64> {
    let rest = sql.split("SET version_number = ").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[async_trait]
impl DriverConnection for FakeConnection {
    async fn is_closed(&mut self) -> bool {
        self.closed
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.db.push("begin");
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.db.push("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.db.push("rollback");
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.db.check_failure(sql)?;
        if sql.starts_with("INSERT INTO database_version") {
            self.db.with(|s| s.version = Some(Some(0)));
        } else if sql.starts_with("UPDATE database_version") {
            if let Some(QueryParam::Int(v)) = params.first() {
                let v = *v;
                self.db.with(|s| s.version = Some(Some(v)));
            }
        }
        let args: Vec<String> = params.iter().map(|p| format!("{:?}", p)).collect();
        self.db
            .push(format!("execute: {} [{}]", sql, args.join(", ")));
        Ok(1)
    }

    async fn execute_many(&mut self, sql: &str, batches: &[Vec<QueryParam>]) -> DbResult<()> {
        for params in batches {
            self.execute(sql, params).await?;
        }
        Ok(())
    }

    async fn execute_script(&mut self, sql: &str) -> DbResult<()> {
        self.db.check_failure(sql)?;
        if sql.starts_with("CREATE TABLE IF NOT EXISTS database_version") {
            self.db.with(|s| {
                if s.version.is_none() {
                    s.version = Some(None);
                }
            });
        } else if let Some(v) = scripted_version(sql) {
            self.db.with(|s| s.version = Some(Some(v)));
        }
        self.db.push(format!("script: {}", sql.trim()));
        Ok(())
    }

    async fn fetch(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.db.check_failure(sql)?;
        self.db.push(format!("fetch: {}", sql));
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        Ok(vec![row])
    }

    async fn fetch_row(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.fetch(sql, params).await?.into_iter().next())
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
        column: usize,
    ) -> DbResult<Option<JsonValue>> {
        self.db.check_failure(sql)?;
        if !sql.contains("FROM database_version") {
            self.db.push(format!("fetch_scalar: {} [{}]", sql, column));
            return Ok(Some(json!(42)));
        }

        let scripted = self.db.with(|s| s.version_reads.pop_front());
        let read = match scripted {
            Some(read) => read,
            None => match self.db.version() {
                None => VersionRead::Missing,
                Some(None) => return Ok(None),
                Some(Some(v)) => VersionRead::Value(v),
            },
        };
        match read {
            VersionRead::Missing => Err(DbError::database(
                "relation \"database_version\" does not exist",
                Some(SQLSTATE_UNDEFINED_TABLE.to_string()),
                "",
            )),
            VersionRead::Value(v) => Ok(Some(json!(v))),
            VersionRead::Error => Err(DbError::database(
                "permission denied for table database_version",
                Some("42501".to_string()),
                "",
            )),
        }
    }
}

/// Connector handing out pools on a shared [`FakeDb`].
#[derive(Clone)]
pub struct FakeConnector {
    pub db: FakeDb,
    fail: Arc<Mutex<bool>>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(db: FakeDb) -> Self {
        Self {
            db,
            fail: Arc::new(Mutex::new(false)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_connects(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolConnector for FakeConnector {
    type Pool = FakePool;

    async fn connect(&self) -> DbResult<FakePool> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(DbError::connection("connection refused", "Start the server"));
        }
        Ok(self.db.pool())
    }
}

/// Write a script directory with the given files.
pub fn write_scripts(dir: &Path, files: &[(&str, &str)]) {
    for (name, sql) in files {
        std::fs::write(dir.join(name), sql).unwrap();
    }
}
