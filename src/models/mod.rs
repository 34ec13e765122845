//! Data models shared by the pool, scope and migration layers.

pub mod connection;
pub mod query;

pub use connection::{DatabaseType, mask_connection_string};
pub use query::{Assignments, DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, Row};
