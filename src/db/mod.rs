//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Credential-bound connections for each supported backend
//! - A bounded, token-aware connection pool
//! - Parameter binding and row to JSON conversion
//! - Database dispatch macros for reducing code duplication

pub mod connection;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod types;

pub use connection::{DbConnection, JsonRow, SqlConnector};
pub use macros::DatabaseType;
pub use params::QueryParam;
pub use pool::{ConnectionPool, Connector, PoolConfig, PooledConnection, PoolStatus};

/// Pool of real database connections.
pub type DbPool = ConnectionPool<SqlConnector>;
