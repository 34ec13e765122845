//! Scoped transactions.
//!
//! A [`TransactionScope`] borrows one connection from a [`ResilientPool`], opens a
//! transaction on it and keeps it until the scope exits. Queries are only accepted while
//! the transaction is active.
//!
//! # Lifecycle
//!
//! ```text
//! idle --enter--> active --commit(start_new)--> active
//!                   |  \--commit--> committed --exit--> done
//!                   \--exit--> rolled back / committed --> done
//! ```
//!
//! The connection is returned to the pool on every exit path. A scope dropped while it
//! still holds a connection rolls back and releases on a background task.
//!
//! # Example
//!
//! ```ignore
//! let mut scope = TransactionScope::from_registry(&registry)?;
//! scope.enter().await?;
//! scope.execute("INSERT INTO events (kind) VALUES ($1)", &["signup".into()]).await?;
//! scope.on_commit(commit_callback(|| async { notify_listeners().await }));
//! scope.commit(false).await?;
//! scope.exit(false).await?;
//! ```

use crate::db::driver::{DriverConnection, DriverPool};
use crate::db::pool::ResilientPool;
use crate::db::registry::PoolRegistry;
use crate::db::update::render_update;
use crate::error::{DbError, DbResult};
use crate::models::{Assignments, QueryParam, Row};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// A parameterless action run after a successful commit.
pub type CommitCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`CommitCallback`].
pub fn commit_callback<F, Fut>(f: F) -> CommitCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Shared list of pending commit callbacks.
///
/// Cloning yields a handle to the same list, so a running callback can register
/// follow-up work for the next commit.
#[derive(Clone, Default)]
pub struct CommitHooks {
    pending: Arc<Mutex<Vec<CommitCallback>>>,
}

impl CommitHooks {
    /// Register `callback` unless the same callback is already pending.
    ///
    /// Returns `false` for a duplicate.
    pub fn register(&self, callback: CommitCallback) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.iter().any(|cb| Arc::ptr_eq(cb, &callback)) {
            return false;
        }
        pending.push(callback);
        true
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<CommitCallback> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for CommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHooks")
            .field("pending", &self.len())
            .finish()
    }
}

pub struct TransactionScope<D: DriverPool> {
    scope_id: String,
    pool: Arc<ResilientPool<D>>,
    registry: Option<PoolRegistry<D>>,
    timeout: Option<Duration>,
    autocommit: bool,
    connection: Option<D::Connection>,
    in_transaction: bool,
    done: bool,
    hooks: CommitHooks,
}

impl<D: DriverPool> TransactionScope<D> {
    /// Create a scope on `pool` with autocommit off and no acquire timeout.
    pub fn new(pool: Arc<ResilientPool<D>>) -> Self {
        Self {
            scope_id: uuid::Uuid::new_v4().to_string(),
            pool,
            registry: None,
            timeout: None,
            autocommit: false,
            connection: None,
            in_transaction: false,
            done: false,
            hooks: CommitHooks::default(),
        }
    }

    /// Create a scope on the registry's default pool.
    ///
    /// The scope can recover the default pool if it turns out to be broken.
    pub fn from_registry(registry: &PoolRegistry<D>) -> DbResult<Self> {
        Ok(Self::new(registry.get()?).with_registry(registry.clone()))
    }

    pub fn with_registry(mut self, registry: PoolRegistry<D>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bound the time spent acquiring a connection on entry.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Commit instead of rolling back when the scope exits without error.
    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn pool(&self) -> &Arc<ResilientPool<D>> {
        &self.pool
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// True once the scope has committed without restarting, or exited.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// New independent scope on the same pool, registry and timeout.
    ///
    /// Inherits this scope's autocommit flag unless `autocommit` is given.
    pub fn acquire(&self, autocommit: Option<bool>) -> Self {
        let mut scope = Self::new(Arc::clone(&self.pool));
        scope.registry = self.registry.clone();
        scope.timeout = self.timeout;
        scope.autocommit = autocommit.unwrap_or(self.autocommit);
        scope
    }

    /// Acquire a connection and begin a transaction.
    pub async fn enter(&mut self) -> DbResult<()> {
        if self.connection.is_some() {
            return Err(DbError::transaction("Connection already in progress"));
        }
        self.done = false;

        let acquired = self.pool.acquire(self.timeout).await;
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) if e.is_broken_link() => self.recover(e).await?,
            Err(e) => return Err(e),
        };

        if let Err(e) = conn.begin().await {
            self.pool.release(conn).await;
            return Err(e);
        }

        debug!(scope_id = %self.scope_id, "Transaction started");
        self.connection = Some(conn);
        self.in_transaction = true;
        Ok(())
    }

    /// Replace a broken default pool and retry acquisition once.
    ///
    /// A failed rebuild or a failed retry is [`DbError::Unrecoverable`].
    async fn recover(&mut self, cause: DbError) -> DbResult<D::Connection> {
        error!(scope_id = %self.scope_id, error = %cause, "Error acquiring connection");

        let registry = match &self.registry {
            Some(registry) if registry.is_default(&self.pool) => registry.clone(),
            _ => return Err(cause),
        };

        let recovered = registry.recover(&self.pool).await?;
        self.pool = recovered;
        self.pool.acquire(self.timeout).await.map_err(|e| {
            error!(scope_id = %self.scope_id, error = %e, "Acquire after recovery failed");
            DbError::unrecoverable(format!("acquire after recovery failed: {}", e))
        })
    }

    /// Resolve the transaction and release the connection.
    ///
    /// Rolls back when `failed` is set or autocommit is off; otherwise commits and runs
    /// the pending callbacks. The connection is released even if that step fails.
    pub async fn exit(&mut self, failed: bool) -> DbResult<()> {
        let result = if self.in_transaction {
            if failed || !self.autocommit {
                self.rollback().await
            } else {
                self.commit(false).await
            }
        } else {
            Ok(())
        };

        self.in_transaction = false;
        self.done = true;
        if let Some(conn) = self.connection.take() {
            self.pool.release(conn).await;
            debug!(scope_id = %self.scope_id, "Connection released");
        }
        result
    }

    /// Exit according to `outcome` and hand it back.
    ///
    /// An error from the body takes precedence over one raised while exiting.
    pub async fn close<T>(&mut self, outcome: DbResult<T>) -> DbResult<T> {
        let exited = self.exit(outcome.is_err()).await;
        match (outcome, exited) {
            (Err(e), Err(exit_err)) => {
                warn!(
                    scope_id = %self.scope_id,
                    error = %exit_err,
                    "Error while exiting failed scope"
                );
                Err(e)
            }
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(exit_err)) => Err(exit_err),
        }
    }

    /// Enter, run `body`, and exit with its outcome.
    ///
    /// ```ignore
    /// let count = scope
    ///     .run(|tx| Box::pin(async move { tx.fetch_scalar("SELECT count(*) FROM t", &[], 0).await }))
    ///     .await?;
    /// ```
    pub async fn run<T, F>(&mut self, body: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, DbResult<T>>,
    {
        self.enter().await?;
        let outcome = body(self).await;
        self.close(outcome).await
    }

    /// Commit the active transaction, then run the pending callbacks in order.
    ///
    /// Callbacks registered while callbacks run are kept for the next commit. With
    /// `start_new` a fresh transaction begins on the same connection; otherwise the
    /// scope is done.
    pub async fn commit(&mut self, start_new: bool) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::no_transaction("No transaction to commit"));
        }
        let callbacks = self.hooks.take();
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| DbError::no_transaction("No transaction to commit"))?;

        let committed = conn.commit().await;
        self.in_transaction = false;

        if committed.is_ok() {
            debug!(
                scope_id = %self.scope_id,
                callbacks = callbacks.len(),
                "Transaction committed"
            );
            for callback in &callbacks {
                callback().await;
            }
        }

        let restarted = if start_new {
            match conn.begin().await {
                Ok(()) => {
                    self.in_transaction = true;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            self.done = true;
            Ok(())
        };

        committed.and(restarted)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        match self.connection.as_mut() {
            Some(conn) => {
                let result = conn.rollback().await;
                debug!(scope_id = %self.scope_id, "Transaction rolled back");
                result
            }
            None => Ok(()),
        }
    }

    /// Register a callback for the next successful commit.
    ///
    /// Registering the same callback twice before a commit has no effect.
    pub fn on_commit(&self, callback: CommitCallback) {
        self.hooks.register(callback);
    }

    /// Handle to this scope's pending callbacks, for use inside callbacks.
    pub fn commit_hooks(&self) -> CommitHooks {
        self.hooks.clone()
    }

    fn active(&mut self) -> DbResult<&mut D::Connection> {
        match self.connection.as_mut() {
            Some(conn) if self.in_transaction => Ok(conn),
            _ => Err(DbError::no_transaction("No transaction in progress")),
        }
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.active()?.execute(sql, params).await
    }

    /// Execute `sql` once per parameter list.
    pub async fn execute_many(&mut self, sql: &str, batches: &[Vec<QueryParam>]) -> DbResult<()> {
        self.active()?.execute_many(sql, batches).await
    }

    pub async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.active()?.fetch(sql, params).await
    }

    pub async fn fetch_row(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        self.active()?.fetch_row(sql, params).await
    }

    /// Fetch the value at `column` of the first row, `None` when no row matches.
    pub async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        column: usize,
    ) -> DbResult<Option<JsonValue>> {
        self.active()?.fetch_scalar(sql, params, column).await
    }

    /// Run `UPDATE table SET ... [WHERE ...]` built from ordered assignments.
    ///
    /// Conditions are equality tests joined with `AND`; `None` updates every row.
    pub async fn update(
        &mut self,
        table: &str,
        assignments: &Assignments,
        conditions: Option<&Assignments>,
    ) -> DbResult<u64> {
        let conn = self.active()?;
        let (sql, args) = render_update(table, assignments, conditions)?;
        conn.execute(&sql, &args).await
    }
}

impl<D: DriverPool> Drop for TransactionScope<D> {
    fn drop(&mut self) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };

        let pool = Arc::clone(&self.pool);
        let in_transaction = self.in_transaction;
        let scope_id = std::mem::take(&mut self.scope_id);

        // Async cleanup needs a runtime; without one the connection is simply dropped.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(scope_id = %scope_id, "Scope dropped outside a runtime, connection discarded");
            return;
        };
        handle.spawn(async move {
            if in_transaction {
                if let Err(e) = conn.rollback().await {
                    warn!(scope_id = %scope_id, error = %e, "Rollback on drop failed");
                }
            }
            pool.release(conn).await;
            warn!(
                scope_id = %scope_id,
                "Scope released via Drop - call exit() explicitly"
            );
        });
    }
}

impl<D: DriverPool> std::fmt::Debug for TransactionScope<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("scope_id", &self.scope_id)
            .field("autocommit", &self.autocommit)
            .field("timeout", &self.timeout)
            .field("has_connection", &self.connection.is_some())
            .field("in_transaction", &self.in_transaction)
            .field("done", &self.done)
            .field("pending_callbacks", &self.hooks.len())
            .finish()
    }
}
