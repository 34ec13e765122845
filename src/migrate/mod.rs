//! Schema migrations.
//!
//! One process (the leader) runs the [`MigrationRunner`] at startup; every other
//! process (followers) blocks in the [`MigrationWaiter`] until the stored version
//! matches the newest script.

pub mod runner;
pub mod source;
pub mod waiter;

pub use runner::{MigrationOutcome, MigrationRunner, SchemaState, VERSION_TABLE, read_schema_version};
pub use source::{BOOTSTRAP_SCRIPT, MigrationSource, migration_file_name};
pub use waiter::{MigrationWaiter, WaitOutcome};

use crate::db::driver::DriverConnection;
use crate::error::DbResult;
use serde::Serialize;

/// Snapshot of scripts on disk against the version stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub bootstrap_present: bool,
    pub latest_script: i64,
    pub schema: SchemaState,
}

impl MigrationStatus {
    /// True when nothing is left to apply.
    pub fn is_current(&self) -> bool {
        matches!(self.schema, SchemaState::Ready(v) if v == self.latest_script)
    }
}

pub async fn migration_status<C>(source: &MigrationSource, conn: &mut C) -> DbResult<MigrationStatus>
where
    C: DriverConnection + ?Sized,
{
    Ok(MigrationStatus {
        bootstrap_present: source.has_bootstrap().await,
        latest_script: source.latest_version().await,
        schema: read_schema_version(conn).await?,
    })
}
