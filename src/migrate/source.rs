//! Migration script discovery.
//!
//! Scripts live in one directory: `create_tables.sql` holds the full schema for a new
//! database and `migrate_00000001.sql`, `migrate_00000002.sql`, ... hold incremental
//! changes. Discovery counts upward from 1 and stops at the first missing number.

use crate::config::DEFAULT_SQL_DIR;
use crate::error::{DbError, DbResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const BOOTSTRAP_SCRIPT: &str = "create_tables.sql";

/// File name of migration script `version`.
pub fn migration_file_name(version: i64) -> String {
    format!("migrate_{:08}.sql", version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSource {
    dir: PathBuf,
}

impl MigrationSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.dir.join(BOOTSTRAP_SCRIPT)
    }

    pub fn migration_path(&self, version: i64) -> PathBuf {
        self.dir.join(migration_file_name(version))
    }

    pub async fn has_bootstrap(&self) -> bool {
        exists(&self.bootstrap_path()).await
    }

    pub async fn read_bootstrap(&self) -> DbResult<String> {
        let path = self.bootstrap_path();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DbError::io(path, e))
    }

    /// Read migration script `version`, `None` if it does not exist.
    pub async fn read_migration(&self, version: i64) -> DbResult<Option<String>> {
        let path = self.migration_path(version);
        match tokio::fs::read_to_string(&path).await {
            Ok(sql) => Ok(Some(sql)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DbError::io(path, e)),
        }
    }

    /// Highest script number reachable from 1 without a gap, 0 if there is none.
    pub async fn latest_version(&self) -> i64 {
        let mut version = 0;
        while exists(&self.migration_path(version + 1)).await {
            version += 1;
        }
        debug!(dir = %self.dir.display(), latest = version, "Scanned migration scripts");
        version
    }
}

impl Default for MigrationSource {
    fn default() -> Self {
        Self::new(DEFAULT_SQL_DIR)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
