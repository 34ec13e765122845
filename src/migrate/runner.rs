//! Sequential schema migration.

use crate::db::driver::DriverConnection;
use crate::error::{DbError, DbResult};
use crate::migrate::source::MigrationSource;
use crate::models::QueryParam;
use serde::Serialize;
use tracing::{error, info, warn};

pub const VERSION_TABLE: &str = "database_version";

const SELECT_VERSION: &str = "SELECT version_number FROM database_version LIMIT 1";
const CREATE_VERSION_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS database_version (version_number INTEGER)";
const INSERT_INITIAL_VERSION: &str = "INSERT INTO database_version (version_number) VALUES (0)";
const UPDATE_VERSION: &str = "UPDATE database_version SET version_number = $1";

/// Stored schema version, as far as it can be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum SchemaState {
    Ready(i64),
    /// The version table does not exist yet, or holds no row.
    NotYetInitialized,
}

/// Read the schema version from `database_version`.
pub async fn read_schema_version<C>(conn: &mut C) -> DbResult<SchemaState>
where
    C: DriverConnection + ?Sized,
{
    match conn.fetch_scalar(SELECT_VERSION, &[], 0).await {
        Ok(Some(value)) => value.as_i64().map(SchemaState::Ready).ok_or_else(|| {
            DbError::internal(format!(
                "{}.version_number holds a non-integer value: {}",
                VERSION_TABLE, value
            ))
        }),
        Ok(None) => Ok(SchemaState::NotYetInitialized),
        Err(e) if e.is_undefined_table() => Ok(SchemaState::NotYetInitialized),
        Err(e) => Err(e),
    }
}

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// No bootstrap script; the database was not touched.
    SkippedNoBootstrap,
    /// Fresh database created from the bootstrap script.
    Bootstrapped {
        /// Version recorded after the bootstrap script ran
        version: i64,
        latest_script: i64,
        /// Scripts exist but the bootstrap script did not record the latest version.
        mismatch: bool,
    },
    /// Existing database brought from `from` to `to`.
    Migrated { from: i64, to: i64 },
}

/// Bootstraps a fresh database or applies pending migration scripts in order.
#[derive(Debug, Clone, Default)]
pub struct MigrationRunner {
    source: MigrationSource,
}

impl MigrationRunner {
    pub fn new(source: MigrationSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    /// Run against one connection outside any transaction.
    ///
    /// If a script fails, the last version that applied cleanly is persisted and the
    /// script's error is returned as [`DbError::Migration`].
    pub async fn run<C>(&self, conn: &mut C) -> DbResult<MigrationOutcome>
    where
        C: DriverConnection + ?Sized,
    {
        if !self.source.has_bootstrap().await {
            warn!(
                path = %self.source.bootstrap_path().display(),
                "Missing bootstrap script: cannot initialise database"
            );
            return Ok(MigrationOutcome::SkippedNoBootstrap);
        }

        match read_schema_version(conn).await? {
            SchemaState::Ready(current) => {
                info!(version = current, "Got database version");
                self.apply_pending(conn, current).await
            }
            SchemaState::NotYetInitialized => self.bootstrap(conn).await,
        }
    }

    async fn bootstrap<C>(&self, conn: &mut C) -> DbResult<MigrationOutcome>
    where
        C: DriverConnection + ?Sized,
    {
        info!("Fresh database, applying bootstrap script");
        conn.execute_script(CREATE_VERSION_TABLE).await?;
        conn.execute(INSERT_INITIAL_VERSION, &[]).await?;

        let sql = self.source.read_bootstrap().await?;
        conn.execute_script(&sql).await?;

        let latest_script = self.source.latest_version().await;
        let version = match read_schema_version(conn).await? {
            SchemaState::Ready(v) => v,
            SchemaState::NotYetInitialized => 0,
        };

        let mismatch = latest_script > 0 && version != latest_script;
        if mismatch {
            warn!(
                db_version = version,
                latest_script,
                "Migration scripts exist but the bootstrap script does not set the database version"
            );
        }

        Ok(MigrationOutcome::Bootstrapped {
            version,
            latest_script,
            mismatch,
        })
    }

    async fn apply_pending<C>(&self, conn: &mut C, current: i64) -> DbResult<MigrationOutcome>
    where
        C: DriverConnection + ?Sized,
    {
        let mut reached = current;
        let mut failure = None;

        loop {
            let next = reached + 1;
            let sql = match self.source.read_migration(next).await {
                Ok(Some(sql)) => sql,
                Ok(None) => break,
                Err(e) => {
                    failure = Some((next, e));
                    break;
                }
            };

            info!(version = next, "Applying migration script {:08}", next);
            if let Err(e) = conn.execute_script(&sql).await {
                error!(version = next, error = %e, "Migration script failed");
                failure = Some((next, e));
                break;
            }
            reached = next;
        }

        conn.execute(UPDATE_VERSION, &[QueryParam::Int(reached)])
            .await?;

        match failure {
            Some((version, e)) => Err(DbError::migration(version, reached, e)),
            None => {
                if reached > current {
                    info!(from = current, to = reached, "Database migrated");
                }
                Ok(MigrationOutcome::Migrated {
                    from: current,
                    to: reached,
                })
            }
        }
    }
}
