//! Single database connections bound to a credential.
//!
//! The pool in [`crate::db::pool`] manages these handles itself, so each backend
//! is a plain sqlx connection rather than a sqlx pool. Sessions are opened
//! read-only where the backend allows it.

use crate::credentials::Credential;
use crate::db::DatabaseType;
use crate::db::params::QueryParam;
use crate::db::pool::Connector;
use crate::error::{LookupError, LookupResult};
use crate::impl_db_dispatch;
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Database row converted to a column-keyed JSON object.
pub type JsonRow = Map<String, JsonValue>;

/// One live database handle.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl DbConnection {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySql,
            Self::Postgres(_) => DatabaseType::Postgres,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Run a read query with bound parameters and convert every row to JSON.
    pub async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> LookupResult<Vec<JsonRow>> {
        debug!(sql = %sql, params = params.len(), "Executing query");
        impl_db_dispatch!(self, {
            MySql(c) => mysql::fetch_rows(c, sql, params, query_timeout).await,
            Postgres(c) => postgres::fetch_rows(c, sql, params, query_timeout).await,
            SQLite(c) => sqlite::fetch_rows(c, sql, params, query_timeout).await,
        })
    }

    /// Close the handle, logging instead of failing.
    pub async fn close(self) {
        let result = match self {
            Self::MySql(c) => c.close().await,
            Self::Postgres(c) => c.close().await,
            Self::SQLite(c) => c.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Connection close reported an error");
        }
    }
}

/// Opens [`DbConnection`]s for one database URL.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    db_type: DatabaseType,
    url: String,
    connect_timeout: Duration,
}

impl SqlConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> LookupResult<Self> {
        let url = url.into();
        let db_type = DatabaseType::from_url(&url)?;
        Ok(Self {
            db_type,
            url,
            connect_timeout,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn open(&self, credential: &Credential) -> LookupResult<DbConnection> {
        match self.db_type {
            DatabaseType::MySql => {
                let mut options = MySqlConnectOptions::from_str(&self.url)
                    .map_err(|e| {
                        LookupError::connection(
                            format!("Invalid MySQL connection string: {}", e),
                            "Check the connection URL format: mysql://user@host:port/database",
                        )
                    })?
                    .charset("utf8mb4");
                if !credential.is_anonymous() {
                    // Access tokens are sent as a cleartext password over TLS.
                    options = options
                        .password(credential.secret())
                        .enable_cleartext_plugin(true);
                }
                let conn = options.connect().await.map_err(|e| self.connect_error(&e))?;
                Ok(DbConnection::MySql(conn))
            }
            DatabaseType::Postgres => {
                let mut options = PgConnectOptions::from_str(&self.url)
                    .map_err(|e| {
                        LookupError::connection(
                            format!("Invalid PostgreSQL connection string: {}", e),
                            "Check the connection URL format: postgres://user@host:5432/database",
                        )
                    })?
                    .options([("default_transaction_read_only", "on")]);
                if !credential.is_anonymous() {
                    options = options.password(credential.secret());
                }
                let conn = options.connect().await.map_err(|e| self.connect_error(&e))?;
                Ok(DbConnection::Postgres(conn))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&self.url)
                    .map_err(|e| {
                        LookupError::connection(
                            format!("Invalid SQLite connection string: {}", e),
                            "Check the connection URL format: sqlite:path/to/db.sqlite",
                        )
                    })?
                    .read_only(true);
                let conn = options.connect().await.map_err(|e| self.connect_error(&e))?;
                Ok(DbConnection::SQLite(conn))
            }
        }
    }

    fn connect_error(&self, error: &sqlx::Error) -> LookupError {
        LookupError::connection(
            format!("Failed to connect: {}", error),
            self.connection_suggestion(error),
        )
    }

    /// Generate a helpful suggestion for connection errors.
    fn connection_suggestion(&self, error: &sqlx::Error) -> String {
        let error_str = error.to_string().to_lowercase();

        if error_str.contains("connection refused") {
            return format!(
                "Check that the {} server is running and accessible",
                self.db_type
            );
        }

        if error_str.contains("authentication") || error_str.contains("password") {
            return "Verify the database identity has been granted access and the token audience is correct"
                .to_string();
        }

        if error_str.contains("does not exist") || error_str.contains("unknown database") {
            return "Check that the database name exists".to_string();
        }

        if error_str.contains("tls") || error_str.contains("ssl") {
            return "Check TLS/SSL configuration; token authentication requires TLS".to_string();
        }

        match self.db_type {
            DatabaseType::Postgres => {
                "Verify the connection string format: postgres://user@host:5432/db".to_string()
            }
            DatabaseType::MySql => {
                "Verify the connection string format: mysql://user@host:3306/db".to_string()
            }
            DatabaseType::SQLite => {
                "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite"
                    .to_string()
            }
        }
    }
}

impl Connector for SqlConnector {
    type Connection = DbConnection;

    async fn connect(&self, credential: &Credential) -> LookupResult<DbConnection> {
        match timeout(self.connect_timeout, self.open(credential)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    db_type = %self.db_type,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "Connection attempt timed out"
                );
                Err(LookupError::connection(
                    format!(
                        "Connection attempt exceeded {}s",
                        self.connect_timeout.as_secs()
                    ),
                    format!("Check that the {} server is reachable", self.db_type),
                ))
            }
        }
    }

    async fn close(&self, conn: DbConnection) {
        conn.close().await;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

fn timeout_error(query_timeout: Duration) -> LookupError {
    LookupError::timeout("query execution", query_timeout.as_secs())
}

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use crate::db::types::RowToJson;

    pub async fn fetch_rows(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> LookupResult<Vec<JsonRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        match timeout(query_timeout, query.fetch_all(&mut *conn)).await {
            Ok(rows) => Ok(rows?.iter().map(RowToJson::to_json_map).collect()),
            Err(_) => Err(timeout_error(query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use crate::db::types::RowToJson;

    pub async fn fetch_rows(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> LookupResult<Vec<JsonRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        match timeout(query_timeout, query.fetch_all(&mut *conn)).await {
            Ok(rows) => Ok(rows?.iter().map(RowToJson::to_json_map).collect()),
            Err(_) => Err(timeout_error(query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use crate::db::types::RowToJson;

    pub async fn fetch_rows(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> LookupResult<Vec<JsonRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        match timeout(query_timeout, query.fetch_all(&mut *conn)).await {
            Ok(rows) => Ok(rows?.iter().map(RowToJson::to_json_map).collect()),
            Err(_) => Err(timeout_error(query_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_detects_backend() {
        let connector = SqlConnector::new("sqlite:lookup.db", Duration::from_secs(1)).unwrap();
        assert_eq!(connector.db_type(), DatabaseType::SQLite);
        assert!(SqlConnector::new("oracle://db", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_connection_suggestion() {
        let connector =
            SqlConnector::new("postgres://svc@db/uw", Duration::from_secs(1)).unwrap();
        let err = sqlx::Error::Configuration("password authentication failed".into());
        assert!(connector.connection_suggestion(&err).contains("token"));
    }

    #[tokio::test]
    async fn test_sqlite_connection_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let mut conn = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .connect()
                .await
                .unwrap();
            sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT)")
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO t (id, body) VALUES (1, 'x')")
                .execute(&mut conn)
                .await
                .unwrap();
        }

        let url = format!("sqlite:{}", path.display());
        let connector = SqlConnector::new(url, Duration::from_secs(5)).unwrap();
        let mut conn = connector.connect(&Credential::anonymous()).await.unwrap();

        let rows = conn
            .fetch_rows(
                "SELECT id, body FROM t WHERE id = ?",
                &[QueryParam::Int(1)],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!(1));
        assert_eq!(rows[0]["body"], serde_json::json!("x"));

        let write = conn
            .fetch_rows(
                "INSERT INTO t (id, body) VALUES (2, 'y') RETURNING id",
                &[],
                Duration::from_secs(5),
            )
            .await;
        assert!(write.is_err());

        conn.close().await;
    }
}
