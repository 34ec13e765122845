//! resilient-db - Main entry point.
//!
//! Runs the schema migration step of a deployment from the command line: `migrate`
//! for the leader, `wait` for followers, `status` for inspection.

use clap::Parser;
use resilient_db::config::{Command, Config};
use resilient_db::db::{PoolConnector, ResilientPool};
use resilient_db::migrate::{MigrationSource, migration_status};
use resilient_db::models::mask_connection_string;
use resilient_db::{Bootstrap, DbError, MigrationRole};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), DbError> {
    let pool_config = config.pool_config()?;
    let source = MigrationSource::new(&config.sql_dir);

    info!(
        database = %mask_connection_string(&pool_config.url),
        sql_dir = %config.sql_dir.display(),
        "Starting resilient-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    match &config.command {
        Command::Migrate => {
            let pool = Bootstrap::new(pool_config)
                .with_source(source)
                .with_role(MigrationRole::Leader)
                .prepare()
                .await?;
            pool.close().await;
        }
        Command::Wait {
            poll_interval,
            timeout,
        } => {
            let bootstrap = Bootstrap::new(pool_config)
                .with_source(source)
                .with_role(MigrationRole::Follower)
                .with_poll_interval(Duration::from_millis(*poll_interval));
            let pool = match timeout {
                Some(secs) => {
                    let limit = Duration::from_secs(*secs);
                    tokio::time::timeout(limit, bootstrap.prepare())
                        .await
                        .map_err(|_| DbError::timeout("waiting for database migration", limit))??
                }
                None => bootstrap.prepare().await?,
            };
            pool.close().await;
        }
        Command::Status => {
            let pool = ResilientPool::new(pool_config.connect().await?);
            let mut conn = pool.acquire(None).await?;
            let status = migration_status(&source, &mut conn).await;
            pool.release(conn).await;
            pool.close().await;

            let status = status?;
            let json = serde_json::to_string_pretty(&status)
                .map_err(|e| DbError::internal(format!("Failed to render status: {}", e)))?;
            println!("{}", json);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(e) = run(&config).await {
        if e.is_unrecoverable() {
            error!(error = %e, "Unrecoverable database failure, exiting");
        } else {
            error!(error = %e, suggestion = ?e.suggestion(), "Command failed");
        }
        std::process::exit(1);
    }
}
