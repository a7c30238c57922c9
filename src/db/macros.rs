//! Backend identification and dispatch macros.
//!
//! The dispatch macro generates match arms over the per-backend connection
//! enum so each call site reads as one linear expression per backend.

use crate::error::{LookupError, LookupResult};

/// Database backend type for dispatch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Detect the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> LookupResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::SQLite),
            _ => Err(LookupError::configuration(format!(
                "Unsupported database URL scheme '{}': expected postgres://, mysql:// or sqlite:",
                scheme
            ))),
        }
    }

    /// Bind placeholder for the 1-based parameter `idx`.
    pub fn placeholder(self, idx: usize) -> String {
        match self {
            Self::Postgres => format!("${}", idx),
            Self::MySql | Self::SQLite => "?".to_string(),
        }
    }

    /// Quote a (possibly dotted) identifier. Callers validate identifiers first.
    pub fn quote_ident(self, ident: &str) -> String {
        let quote = match self {
            Self::MySql => '`',
            Self::Postgres | Self::SQLite => '"',
        };
        ident
            .split('.')
            .map(|part| format!("{quote}{part}{quote}"))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySql => write!(f, "MySQL"),
            Self::Postgres => write!(f, "PostgreSQL"),
            Self::SQLite => write!(f, "SQLite"),
        }
    }
}

/// Macro for generating connection dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::fetch_rows(c, sql, params, timeout).await,
///     Postgres(c) => postgres::fetch_rows(c, sql, params, timeout).await,
///     SQLite(c) => sqlite::fetch_rows(c, sql, params, timeout).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
