//! Startup: open the pool and bring the schema up to date.
//!
//! ```ignore
//! let config = PoolConfig::parse(&url)?;
//! let registry = Bootstrap::new(config)
//!     .with_source(MigrationSource::new("sql"))
//!     .with_role(MigrationRole::Leader)
//!     .into_registry()
//!     .await?;
//! ```

use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::db::driver::PoolConnector;
use crate::db::pool::ResilientPool;
use crate::db::registry::{PoolRecovery, PoolRegistry};
use crate::error::DbResult;
use crate::migrate::{MigrationRunner, MigrationSource, MigrationWaiter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Whether this process applies migrations or waits for another process to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationRole {
    #[default]
    Leader,
    Follower,
}

pub struct Bootstrap<C: PoolConnector> {
    connector: C,
    source: MigrationSource,
    role: MigrationRole,
    poll_interval: Duration,
}

impl<C: PoolConnector> Bootstrap<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            source: MigrationSource::default(),
            role: MigrationRole::Leader,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_source(mut self, source: MigrationSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_role(mut self, role: MigrationRole) -> Self {
        self.role = role;
        self
    }

    /// Poll interval used while waiting as a follower.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn role(&self) -> MigrationRole {
        self.role
    }

    /// Open a pool and run the migration step for the configured role.
    pub async fn prepare(&self) -> DbResult<Arc<ResilientPool<C::Pool>>> {
        self.prepare_as(self.role).await
    }

    async fn prepare_as(&self, role: MigrationRole) -> DbResult<Arc<ResilientPool<C::Pool>>> {
        let pool = Arc::new(ResilientPool::new(self.connector.connect().await?));

        let mut conn = pool.acquire(None).await?;
        let result = match role {
            MigrationRole::Leader => MigrationRunner::new(self.source.clone())
                .run(&mut conn)
                .await
                .map(|outcome| info!(?outcome, "Database prepared")),
            MigrationRole::Follower => MigrationWaiter::new(self.source.clone())
                .with_poll_interval(self.poll_interval)
                .wait(&mut conn)
                .await
                .map(|outcome| info!(?outcome, "Database ready")),
        };
        pool.release(conn).await;

        if let Err(e) = result {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }

    /// Prepare the pool and install it as the default of a new registry.
    ///
    /// The registry keeps this bootstrap as its recovery procedure; recovery always
    /// waits for the schema instead of migrating it.
    pub async fn into_registry(self) -> DbResult<PoolRegistry<C::Pool>> {
        let pool = self.prepare().await?;
        let registry = PoolRegistry::with_recovery(Arc::new(self));
        registry.set(pool);
        Ok(registry)
    }
}

#[async_trait]
impl<C: PoolConnector> PoolRecovery<C::Pool> for Bootstrap<C> {
    async fn rebuild(&self) -> DbResult<Arc<ResilientPool<C::Pool>>> {
        self.prepare_as(MigrationRole::Follower).await
    }
}

impl<C: PoolConnector + std::fmt::Debug> std::fmt::Debug for Bootstrap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("connector", &self.connector)
            .field("source", &self.source)
            .field("role", &self.role)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
