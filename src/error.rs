//! Error types for the submission lookup service.
//!
//! This module defines all error types using `thiserror`. Every failure a lookup
//! can hit is one of these variants; the request boundary turns them into the
//! uniform failure response instead of letting them escape.

use schemars::JsonSchema;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Unsupported identifier_type '{kind}'. Valid types: {}", .valid.join(", "))]
    UnsupportedIdentifierKind { kind: String, valid: Vec<String> },

    #[error("identifier_value must not be empty")]
    EmptyIdentifierValue,

    #[error("No submission found for {kind} '{value}'")]
    IdentifierNotFound { kind: String, value: String },

    #[error("{kind} '{value}' matches more than one submission")]
    AmbiguousIdentifier { kind: String, value: String },

    #[error("Submission {submission_id} was resolved but has no detail record")]
    DetailsNotFound { submission_id: i64 },

    #[error(
        "Invalid section(s): {}. Allowed sections: {}",
        .invalid.join(", "),
        .allowed.join(", ")
    )]
    InvalidSections {
        invalid: Vec<String>,
        allowed: Vec<String>,
    },

    #[error("Too many sections requested: {requested} (maximum {max})")]
    TooManySections { requested: usize, max: usize },

    #[error("Payload too large for section(s) {}: {detail}", .sections.join(", "))]
    PayloadTooLarge {
        sections: Vec<String>,
        detail: String,
    },

    #[error("Connection unavailable: {message}")]
    ConnectionUnavailable { message: String, suggestion: String },

    #[error("Authentication unavailable: {message}")]
    AuthUnavailable { message: String },

    #[error("Connection pool exhausted: no connection released within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Machine-readable error category carried in failure responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedIdentifierKind,
    EmptyIdentifierValue,
    IdentifierNotFound,
    AmbiguousIdentifier,
    DetailsNotFound,
    InvalidSections,
    TooManySections,
    PayloadTooLarge,
    ConnectionUnavailable,
    AuthUnavailable,
    PoolExhausted,
    Timeout,
    Database,
    Configuration,
    Internal,
}

impl LookupError {
    /// Create an unsupported identifier kind error listing the valid kinds.
    pub fn unsupported_identifier_kind(
        kind: impl Into<String>,
        valid: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::UnsupportedIdentifierKind {
            kind: kind.into(),
            valid: valid.into_iter().map(Into::into).collect(),
        }
    }

    /// Create an identifier not found error.
    pub fn identifier_not_found(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self::IdentifierNotFound {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Create an ambiguous identifier error.
    pub fn ambiguous_identifier(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self::AmbiguousIdentifier {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Create a payload too large error.
    pub fn payload_too_large(sections: Vec<String>, detail: impl Into<String>) -> Self {
        Self::PayloadTooLarge {
            sections,
            detail: detail.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthUnavailable {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedIdentifierKind { .. } => ErrorKind::UnsupportedIdentifierKind,
            Self::EmptyIdentifierValue => ErrorKind::EmptyIdentifierValue,
            Self::IdentifierNotFound { .. } => ErrorKind::IdentifierNotFound,
            Self::AmbiguousIdentifier { .. } => ErrorKind::AmbiguousIdentifier,
            Self::DetailsNotFound { .. } => ErrorKind::DetailsNotFound,
            Self::InvalidSections { .. } => ErrorKind::InvalidSections,
            Self::TooManySections { .. } => ErrorKind::TooManySections,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            Self::AuthUnavailable { .. } => ErrorKind::AuthUnavailable,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Database { .. } => ErrorKind::Database,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionUnavailable { suggestion, .. } => Some(suggestion),
            Self::InvalidSections { .. } | Self::PayloadTooLarge { .. } => {
                Some("Retry with fewer or different sections")
            }
            Self::PoolExhausted { .. } => Some("Retry once in-flight lookups complete"),
            _ => None,
        }
    }

    /// Message safe to hand back to callers.
    ///
    /// Driver and internal failures are logged in full but reported generically.
    pub fn public_message(&self) -> String {
        match self {
            Self::Database { .. } => "Database error while retrieving submission".to_string(),
            Self::Internal { .. } => "Internal error while retrieving submission".to_string(),
            Self::Configuration { .. } => "Lookup service is misconfigured".to_string(),
            Self::ConnectionUnavailable { .. } => {
                "Database connection unavailable; retry later".to_string()
            }
            Self::AuthUnavailable { .. } => {
                "Database authentication unavailable; retry later".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Whether the connection that produced this error must not be reused.
    pub fn taints_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::Timeout { .. }
                | Self::Database { .. }
                | Self::Internal { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::AuthUnavailable { .. }
                | Self::PoolExhausted { .. }
                | Self::Timeout { .. }
        )
    }
}

/// Convert sqlx errors to LookupError.
impl From<sqlx::Error> for LookupError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => LookupError::connection(
                msg.to_string(),
                "Check the database URL format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                LookupError::database(db_err.message(), code)
            }
            sqlx::Error::Io(io_err) => LookupError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => LookupError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => LookupError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::PoolTimedOut => LookupError::timeout("connection acquire", 0),
            sqlx::Error::ColumnNotFound(col) => {
                LookupError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                LookupError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                LookupError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => LookupError::internal("Database worker crashed"),
            _ => LookupError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for lookup operations.
pub type LookupResult<T> = Result<T, LookupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_kind_lists_valid_kinds() {
        let err = LookupError::unsupported_identifier_kind(
            "email",
            ["friendly_id", "convr_id", "internal_id"],
        );
        let msg = err.to_string();
        assert!(msg.contains("'email'"));
        assert!(msg.contains("friendly_id, convr_id, internal_id"));
        assert_eq!(err.kind(), ErrorKind::UnsupportedIdentifierKind);
    }

    #[test]
    fn test_invalid_sections_message_enumerates_allowed() {
        let err = LookupError::InvalidSections {
            invalid: vec!["bogus".to_string()],
            allowed: vec!["insured".to_string(), "overview".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid section(s): bogus. Allowed sections: insured, overview"
        );
    }

    #[test]
    fn test_public_message_hides_database_detail() {
        let err = LookupError::database("relation \"secret_table\" does not exist", None);
        assert!(!err.public_message().contains("secret_table"));
        assert!(err.to_string().contains("secret_table"));
    }

    #[test]
    fn test_validation_errors_keep_their_message() {
        let err = LookupError::TooManySections {
            requested: 7,
            max: 5,
        };
        assert_eq!(err.public_message(), err.to_string());
    }

    #[test]
    fn test_taints_connection() {
        assert!(LookupError::database("boom", None).taints_connection());
        assert!(LookupError::timeout("query", 30).taints_connection());
        assert!(!LookupError::EmptyIdentifierValue.taints_connection());
        assert!(!LookupError::DetailsNotFound { submission_id: 1 }.taints_connection());
    }

    #[test]
    fn test_error_retryable() {
        assert!(LookupError::PoolExhausted { waited_ms: 10 }.is_retryable());
        assert!(LookupError::auth("no token").is_retryable());
        assert!(!LookupError::EmptyIdentifierValue.is_retryable());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PayloadTooLarge).unwrap();
        assert_eq!(json, "\"payload_too_large\"");
    }

    #[test]
    fn test_connection_error_suggestion() {
        let err = LookupError::connection("refused", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
    }
}
