//! Connection pool that survives silently dropped connections.
//!
//! Idle connections can be closed by the server or by a middlebox without the native
//! pool noticing. [`ResilientPool`] checks every connection it hands out and discards
//! closed ones, so callers never see a dead connection.

use crate::db::driver::{DriverConnection, DriverPool};
use crate::error::{DbError, DbResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct ResilientPool<D: DriverPool> {
    driver: D,
    discarded: AtomicU64,
}

impl<D: DriverPool> ResilientPool<D> {
    /// Wrap a native pool.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            discarded: AtomicU64::new(0),
        }
    }

    /// Check out a live connection.
    ///
    /// Closed connections are released back to the native pool and the acquisition is
    /// retried, as many times as it takes. `timeout` bounds the whole loop, not each
    /// attempt.
    pub async fn acquire(&self, timeout: Option<Duration>) -> DbResult<D::Connection> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));

        loop {
            let remaining = match deadline {
                Some((at, total)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(DbError::timeout("connection pool acquire", total));
                    }
                    Some(at - now)
                }
                None => None,
            };

            let mut conn = self.driver.acquire(remaining).await?;
            if !conn.is_closed().await {
                debug!("Acquired live connection");
                return Ok(conn);
            }

            let discarded = self.discarded.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                discarded_total = discarded,
                "Discarding closed connection handed out by the pool"
            );
            self.driver.release(conn).await;
            tokio::task::yield_now().await;
        }
    }

    /// Return a connection to the native pool.
    pub async fn release(&self, conn: D::Connection) {
        self.driver.release(conn).await;
    }

    /// Close the native pool.
    pub async fn close(&self) {
        self.driver.close().await;
    }

    /// Number of closed connections discarded so far.
    pub fn discarded_connections(&self) -> u64 {
        self.discarded.load(Ordering::Acquire)
    }

    /// Access the wrapped native pool.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: DriverPool + std::fmt::Debug> std::fmt::Debug for ResilientPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientPool")
            .field("driver", &self.driver)
            .field("discarded", &self.discarded.load(Ordering::Relaxed))
            .finish()
    }
}
