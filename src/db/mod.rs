//! Database access layer.
//!
//! - Driver adapter traits and their sqlx implementation
//! - Resilient connection pool and the default-pool registry
//! - Scoped transactions with post-commit callbacks

pub mod backend;
pub mod driver;
pub(crate) mod params;
pub mod pool;
pub mod registry;
pub mod scope;
pub mod types;
pub mod update;

pub use backend::{NativePool, SqlxConnection, SqlxPool};
pub use driver::{DriverConnection, DriverPool, PoolConnector};
pub use pool::ResilientPool;
pub use registry::{PoolRecovery, PoolRegistry};
pub use scope::{CommitCallback, CommitHooks, TransactionScope, commit_callback};
pub use update::render_update;
