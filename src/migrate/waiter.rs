//! Blocking until another process has migrated the database.

use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::db::driver::DriverConnection;
use crate::error::DbResult;
use crate::migrate::runner::{SchemaState, read_schema_version};
use crate::migrate::source::MigrationSource;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "version", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// No bootstrap script; nothing to wait for.
    SkippedNoBootstrap,
    /// The stored version matched the latest script.
    Reached(i64),
}

/// Polls the version table until it matches the newest migration script.
///
/// There is no upper bound on the wait; wrap [`MigrationWaiter::wait`] in
/// `tokio::time::timeout` to impose one.
#[derive(Debug, Clone)]
pub struct MigrationWaiter {
    source: MigrationSource,
    poll_interval: Duration,
}

impl MigrationWaiter {
    pub fn new(source: MigrationSource) -> Self {
        Self {
            source,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn wait<C>(&self, conn: &mut C) -> DbResult<WaitOutcome>
    where
        C: DriverConnection + ?Sized,
    {
        if !self.source.has_bootstrap().await {
            warn!(
                path = %self.source.bootstrap_path().display(),
                "Missing bootstrap script: cannot initialise database"
            );
            return Ok(WaitOutcome::SkippedNoBootstrap);
        }

        let expected = self.source.latest_version().await;

        loop {
            match read_schema_version(conn).await? {
                SchemaState::Ready(version) if version == expected => break,
                SchemaState::Ready(version) if version > expected => {
                    warn!(
                        stored = version,
                        expected,
                        "Database version is ahead of the available migration scripts"
                    );
                }
                SchemaState::Ready(version) => {
                    debug!(stored = version, expected, "Database not migrated yet");
                }
                // First start of the whole system: the leader has not created it yet.
                SchemaState::NotYetInitialized => {
                    debug!("Version table does not exist yet");
                }
            }
            info!(expected, "Waiting for database migration...");
            tokio::time::sleep(self.poll_interval).await;
        }

        info!(version = expected, "Got database version");
        Ok(WaitOutcome::Reached(expected))
    }
}
