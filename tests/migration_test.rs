//! Migration runner, waiter and status tests against the in-memory driver.

mod common;

use common::{FakeConnector, FakeDb, VersionRead, write_scripts};
use resilient_db::db::ResilientPool;
use resilient_db::error::DbError;
use resilient_db::migrate::{
    MigrationOutcome, MigrationRunner, MigrationSource, MigrationWaiter, SchemaState, WaitOutcome,
    migration_status, read_schema_version,
};
use resilient_db::{Bootstrap, MigrationRole};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

const BOOTSTRAP: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY);";
const BOOTSTRAP_AT_3: &str =
    "CREATE TABLE users (id INTEGER PRIMARY KEY);\nUPDATE database_version SET version_number = 3;";
const M1: &str = "ALTER TABLE users ADD COLUMN name TEXT;";
const M2: &str = "ALTER TABLE users ADD COLUMN email TEXT;";
const M3: &str = "CREATE INDEX users_email ON users (email);";

fn scripts(dir: &TempDir, bootstrap: &str) -> MigrationSource {
    write_scripts(
        dir.path(),
        &[
            ("create_tables.sql", bootstrap),
            ("migrate_00000001.sql", M1),
            ("migrate_00000002.sql", M2),
            ("migrate_00000003.sql", M3),
        ],
    );
    MigrationSource::new(dir.path())
}

async fn run(db: &FakeDb, source: MigrationSource) -> Result<MigrationOutcome, DbError> {
    let pool = ResilientPool::new(db.pool());
    let mut conn = pool.acquire(None).await?;
    let result = MigrationRunner::new(source).run(&mut conn).await;
    pool.release(conn).await;
    result
}

async fn wait(db: &FakeDb, source: MigrationSource) -> Result<WaitOutcome, DbError> {
    let pool = ResilientPool::new(db.pool());
    let mut conn = pool.acquire(None).await?;
    let result = MigrationWaiter::new(source)
        .with_poll_interval(Duration::from_millis(1))
        .wait(&mut conn)
        .await;
    pool.release(conn).await;
    result
}

fn scripts_run(db: &FakeDb) -> Vec<String> {
    db.events()
        .into_iter()
        .filter(|e| e.starts_with("script: ") || e.starts_with("failed: "))
        .collect()
}

#[tokio::test]
async fn test_pending_scripts_apply_in_order() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(0));

    let outcome = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::Migrated { from: 0, to: 3 });
    assert_eq!(
        scripts_run(&db),
        vec![
            format!("script: {}", M1),
            format!("script: {}", M2),
            format!("script: {}", M3),
        ]
    );
    assert_eq!(db.version(), Some(Some(3)));
}

#[tokio::test]
async fn test_only_newer_scripts_apply() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(2));

    let outcome = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::Migrated { from: 2, to: 3 });
    assert_eq!(scripts_run(&db), vec![format!("script: {}", M3)]);
}

#[tokio::test]
async fn test_failed_script_records_last_good_version() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(0));
    db.fail_on(M2);

    let err = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap_err();

    match &err {
        DbError::Migration {
            version, reached, ..
        } => {
            assert_eq!(*version, 2);
            assert_eq!(*reached, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("00000002"));
    assert_eq!(
        scripts_run(&db),
        vec![format!("script: {}", M1), format!("failed: {}", M2)]
    );
    assert_eq!(db.version(), Some(Some(1)));
    assert!(db.events().contains(&format!(
        "execute: UPDATE database_version SET version_number = $1 [{:?}]",
        resilient_db::models::QueryParam::Int(1)
    )));
}

#[tokio::test]
async fn test_up_to_date_database_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(3));

    let outcome = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::Migrated { from: 3, to: 3 });
    assert!(scripts_run(&db).is_empty());
    assert_eq!(db.version(), Some(Some(3)));
}

#[tokio::test]
async fn test_fresh_database_bootstraps_without_mismatch() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();

    let outcome = run(&db, scripts(&dir, BOOTSTRAP_AT_3)).await.unwrap();

    assert_eq!(
        outcome,
        MigrationOutcome::Bootstrapped {
            version: 3,
            latest_script: 3,
            mismatch: false,
        }
    );
    // Incremental scripts are never run on a fresh database.
    let run = scripts_run(&db);
    assert_eq!(run.len(), 2, "{run:?}");
    assert!(run[0].starts_with("script: CREATE TABLE IF NOT EXISTS database_version"));
    assert_eq!(run[1], format!("script: {}", BOOTSTRAP_AT_3));
}

#[tokio::test]
async fn test_fresh_database_bootstrap_reports_mismatch() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();

    let outcome = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(
        outcome,
        MigrationOutcome::Bootstrapped {
            version: 0,
            latest_script: 3,
            mismatch: true,
        }
    );
    assert_eq!(db.version(), Some(Some(0)));
}

#[tokio::test]
async fn test_empty_version_table_is_treated_as_fresh() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(None);

    let outcome = run(&db, scripts(&dir, BOOTSTRAP_AT_3)).await.unwrap();
    assert!(matches!(outcome, MigrationOutcome::Bootstrapped { version: 3, .. }));
}

#[tokio::test]
async fn test_bootstrap_script_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.fail_on(BOOTSTRAP);

    let err = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
}

#[tokio::test]
async fn test_runner_skips_without_bootstrap_script() {
    let dir = TempDir::new().unwrap();
    write_scripts(dir.path(), &[("migrate_00000001.sql", M1)]);
    let db = FakeDb::new();

    let outcome = run(&db, MigrationSource::new(dir.path())).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::SkippedNoBootstrap);
    assert!(db.events().iter().all(|e| e == "release"));
    assert_eq!(db.version(), None);
}

#[tokio::test]
async fn test_version_read_error_propagates() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(0));
    db.script_version_reads([VersionRead::Error]);

    let err = run(&db, scripts(&dir, BOOTSTRAP)).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert!(scripts_run(&db).is_empty());
}

#[tokio::test]
async fn test_waiter_polls_until_latest_version() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.script_version_reads([
        VersionRead::Missing,
        VersionRead::Value(2),
        VersionRead::Value(3),
    ]);

    let outcome = wait(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(outcome, WaitOutcome::Reached(3));
    assert_eq!(db.remaining_version_reads(), 0);
    assert!(scripts_run(&db).is_empty());
}

#[tokio::test]
async fn test_waiter_keeps_waiting_when_database_is_ahead() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.script_version_reads([VersionRead::Value(5), VersionRead::Value(3)]);

    let outcome = wait(&db, scripts(&dir, BOOTSTRAP)).await.unwrap();

    assert_eq!(outcome, WaitOutcome::Reached(3));
    assert_eq!(db.remaining_version_reads(), 0);
}

#[tokio::test]
async fn test_waiter_without_scripts_expects_version_zero() {
    let dir = TempDir::new().unwrap();
    write_scripts(dir.path(), &[("create_tables.sql", BOOTSTRAP)]);
    let db = FakeDb::new();
    db.set_version(Some(0));

    let outcome = wait(&db, MigrationSource::new(dir.path())).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Reached(0));
}

#[tokio::test]
async fn test_waiter_skips_without_bootstrap_script() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();

    let outcome = wait(&db, MigrationSource::new(dir.path())).await.unwrap();
    assert_eq!(outcome, WaitOutcome::SkippedNoBootstrap);
}

#[tokio::test]
async fn test_waiter_propagates_read_errors() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.script_version_reads([VersionRead::Missing, VersionRead::Error]);

    let err = wait(&db, scripts(&dir, BOOTSTRAP)).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
}

#[tokio::test]
async fn test_waiter_is_unbounded_without_timeout() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(1));

    let waited =
        tokio::time::timeout(Duration::from_millis(50), wait(&db, scripts(&dir, BOOTSTRAP))).await;
    assert!(waited.is_err());
}

#[tokio::test]
async fn test_read_schema_version_states() {
    let db = FakeDb::new();
    let pool = ResilientPool::new(db.pool());
    let mut conn = pool.acquire(None).await.unwrap();

    assert_eq!(
        read_schema_version(&mut conn).await.unwrap(),
        SchemaState::NotYetInitialized
    );
    db.set_version(None);
    assert_eq!(
        read_schema_version(&mut conn).await.unwrap(),
        SchemaState::NotYetInitialized
    );
    db.set_version(Some(7));
    assert_eq!(
        read_schema_version(&mut conn).await.unwrap(),
        SchemaState::Ready(7)
    );
    pool.release(conn).await;
}

#[tokio::test]
async fn test_migration_status() {
    let dir = TempDir::new().unwrap();
    let source = scripts(&dir, BOOTSTRAP);
    let db = FakeDb::new();
    let pool = ResilientPool::new(db.pool());
    let mut conn = pool.acquire(None).await.unwrap();

    let status = migration_status(&source, &mut conn).await.unwrap();
    assert!(status.bootstrap_present);
    assert_eq!(status.latest_script, 3);
    assert!(!status.is_current());
    assert_eq!(
        serde_json::to_value(&status).unwrap(),
        json!({
            "bootstrap_present": true,
            "latest_script": 3,
            "schema": { "state": "not_yet_initialized" }
        })
    );

    db.set_version(Some(3));
    let status = migration_status(&source, &mut conn).await.unwrap();
    assert!(status.is_current());
    assert_eq!(
        serde_json::to_value(&status.schema).unwrap(),
        json!({ "state": "ready", "version": 3 })
    );
    pool.release(conn).await;
}

#[tokio::test]
async fn test_bootstrap_follower_returns_ready_pool() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(3));
    let connector = FakeConnector::new(db.clone());

    let pool = Bootstrap::new(connector.clone())
        .with_source(scripts(&dir, BOOTSTRAP))
        .with_role(MigrationRole::Follower)
        .with_poll_interval(Duration::from_millis(1))
        .prepare()
        .await
        .unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(db.acquires(), db.releases());
    assert_eq!(db.pools_closed(), 0);
    assert!(scripts_run(&db).is_empty());
    pool.close().await;
}

#[tokio::test]
async fn test_bootstrap_failure_closes_pool() {
    let dir = TempDir::new().unwrap();
    let db = FakeDb::new();
    db.set_version(Some(0));
    db.fail_on(M1);
    let connector = FakeConnector::new(db.clone());

    let err = Bootstrap::new(connector)
        .with_source(scripts(&dir, BOOTSTRAP))
        .prepare()
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Migration { version: 1, reached: 0, .. }));
    assert_eq!(db.acquires(), 1);
    assert_eq!(db.releases(), 1);
    assert_eq!(db.pools_closed(), 1);
}
