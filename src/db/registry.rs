//! Process-wide default pool.
//!
//! A [`PoolRegistry`] is created once at startup, handed to every component that needs
//! "the" database, and torn down with [`PoolRegistry::shutdown`]. It is a cheap-to-clone
//! handle; all clones observe the same pool.
//!
//! # Recovery
//!
//! When a scope on the default pool fails to acquire because the connection no longer
//! exists, it calls [`PoolRegistry::recover`]. Recovery is serialized: the first caller
//! clears the registry, closes the broken pool and rebuilds a new one through the
//! installed [`PoolRecovery`]; callers that were queued behind it find the pool already
//! replaced and reuse the new one.

use crate::db::driver::DriverPool;
use crate::db::pool::ResilientPool;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Procedure that produces a replacement pool after a broken-link failure.
#[async_trait]
pub trait PoolRecovery<D: DriverPool>: Send + Sync {
    async fn rebuild(&self) -> DbResult<Arc<ResilientPool<D>>>;
}

struct RegistryInner<D: DriverPool> {
    current: RwLock<Option<Arc<ResilientPool<D>>>>,
    recovery: Option<Arc<dyn PoolRecovery<D>>>,
    /// Serializes recovery attempts.
    recovering: Mutex<()>,
}

pub struct PoolRegistry<D: DriverPool> {
    inner: Arc<RegistryInner<D>>,
}

impl<D: DriverPool> Clone for PoolRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DriverPool> PoolRegistry<D> {
    /// Create an empty registry without a recovery procedure.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty registry that can rebuild its pool.
    pub fn with_recovery(recovery: Arc<dyn PoolRecovery<D>>) -> Self {
        Self::build(Some(recovery))
    }

    fn build(recovery: Option<Arc<dyn PoolRecovery<D>>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                current: RwLock::new(None),
                recovery,
                recovering: Mutex::new(()),
            }),
        }
    }

    /// Install the default pool, returning the one it replaces.
    pub fn set(&self, pool: Arc<ResilientPool<D>>) -> Option<Arc<ResilientPool<D>>> {
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        current.replace(pool)
    }

    /// Get the default pool.
    pub fn get(&self) -> DbResult<Arc<ResilientPool<D>>> {
        self.try_get()
            .ok_or_else(|| DbError::internal("database not prepared before use"))
    }

    pub fn try_get(&self) -> Option<Arc<ResilientPool<D>>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove the default pool without closing it.
    pub fn clear(&self) -> Option<Arc<ResilientPool<D>>> {
        self.inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Check whether `pool` is the current default pool.
    pub fn is_default(&self, pool: &Arc<ResilientPool<D>>) -> bool {
        self.try_get()
            .is_some_and(|current| Arc::ptr_eq(&current, pool))
    }

    pub fn has_recovery(&self) -> bool {
        self.inner.recovery.is_some()
    }

    /// Replace a broken default pool.
    ///
    /// Any failure here is reported as [`DbError::Unrecoverable`].
    pub async fn recover(
        &self,
        failed: &Arc<ResilientPool<D>>,
    ) -> DbResult<Arc<ResilientPool<D>>> {
        let _guard = self.inner.recovering.lock().await;

        if let Some(current) = self.try_get() {
            if !Arc::ptr_eq(&current, failed) {
                info!("Default database pool already recovered");
                return Ok(current);
            }
        }

        let Some(recovery) = self.inner.recovery.clone() else {
            error!("No recovery procedure installed for the default database pool");
            return Err(DbError::unrecoverable(
                "default pool is broken and no recovery procedure is installed",
            ));
        };

        warn!("Recovering default database pool");
        self.clear();
        failed.close().await;

        match recovery.rebuild().await {
            Ok(pool) => {
                self.set(Arc::clone(&pool));
                info!("Default database pool recovered");
                Ok(pool)
            }
            Err(e) => {
                error!(error = %e, "Unable to recover default database pool");
                Err(DbError::unrecoverable(format!(
                    "rebuilding the default pool failed: {}",
                    e
                )))
            }
        }
    }

    /// Clear the registry and close the pool it held.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.clear() {
            info!("Closing default database pool");
            pool.close().await;
        }
    }
}

impl<D: DriverPool> Default for PoolRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DriverPool> std::fmt::Debug for PoolRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("has_pool", &self.try_get().is_some())
            .field("has_recovery", &self.has_recovery())
            .finish()
    }
}
