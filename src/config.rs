//! Configuration handling for the submission lookup server.
//!
//! Every setting is read from a `LOOKUP_*` environment variable (a `.env` file is
//! loaded first by `main`); the same settings are accepted as CLI flags.

use crate::db::pool::PoolConfig;
use crate::lookup::dispatcher::Guardrails;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_POOL_MAX_SIZE: usize = 5;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 2700;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_SECTIONS: usize = 5;
pub const DEFAULT_MAX_SECTION_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// How pooled connections authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AuthMode {
    /// Bearer token from the environment identity, falling back to a CLI command
    #[default]
    Token,
    /// No credential (local SQLite files, trusted sockets)
    None,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A `name=column` allowlist override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionOverride {
    pub name: String,
    pub column: String,
}

impl SectionOverride {
    /// Parse a section override from `name=column`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, column) = s
            .split_once('=')
            .ok_or_else(|| format!("Invalid section mapping '{s}': expected name=column"))?;
        let name = name.trim();
        let column = column.trim();
        if name.is_empty() || column.is_empty() {
            return Err(format!(
                "Invalid section mapping '{s}': name and column must be non-empty"
            ));
        }
        Ok(Self {
            name: name.to_string(),
            column: column.to_string(),
        })
    }
}

/// Configuration for the submission lookup server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "submission-lookup",
    about = "MCP server that resolves submission identifiers and fetches allowlisted detail sections",
    version,
    author
)]
pub struct Config {
    /// Database URL (postgres://, mysql:// or sqlite:). Credentials come from the
    /// token provider, not the URL.
    #[arg(long, value_name = "URL", env = "LOOKUP_DATABASE_URL", default_value = "")]
    pub database_url: String,

    /// Maximum live connections. 0 disables pooling: every connection is closed after use.
    #[arg(long, default_value_t = DEFAULT_POOL_MAX_SIZE, env = "LOOKUP_POOL_MAX_SIZE")]
    pub pool_max_size: usize,

    /// Seconds a connection's token is trusted before the connection is recreated
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_SECS, env = "LOOKUP_TOKEN_TTL_SECS")]
    pub token_ttl_secs: u64,

    /// Seconds to wait for a pooled connection. 0 waits indefinitely.
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "LOOKUP_ACQUIRE_TIMEOUT_SECS"
    )]
    pub acquire_timeout_secs: u64,

    /// Connection (and token command) timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "LOOKUP_CONNECT_TIMEOUT_SECS"
    )]
    pub connect_timeout_secs: u64,

    /// Query timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "LOOKUP_QUERY_TIMEOUT_SECS"
    )]
    pub query_timeout_secs: u64,

    /// Maximum sections per request
    #[arg(long, default_value_t = DEFAULT_MAX_SECTIONS, env = "LOOKUP_MAX_SECTIONS")]
    pub max_sections: usize,

    /// Maximum serialized size of a single section in bytes
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SECTION_BYTES,
        env = "LOOKUP_MAX_SECTION_BYTES"
    )]
    pub max_section_bytes: usize,

    /// Maximum serialized size of all sections together in bytes
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_RESPONSE_BYTES,
        env = "LOOKUP_MAX_RESPONSE_BYTES"
    )]
    pub max_response_bytes: usize,

    /// Authentication mode for database connections
    #[arg(long, value_enum, default_value = "token", env = "LOOKUP_AUTH_MODE")]
    pub auth_mode: AuthMode,

    /// Pre-issued access token (environment identity)
    #[arg(long, env = "LOOKUP_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// File containing a projected access token, re-read on every fetch (environment identity)
    #[arg(long, env = "LOOKUP_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Command printing an access token on stdout (fallback identity chain)
    #[arg(long, env = "LOOKUP_TOKEN_COMMAND")]
    pub token_command: Option<String>,

    /// Section allowlist overrides as name=column. Replaces the built-in mapping.
    #[arg(
        long = "section",
        value_name = "NAME=COLUMN",
        env = "LOOKUP_SECTIONS",
        value_delimiter = ',',
        value_parser = SectionOverride::parse
    )]
    pub sections: Vec<SectionOverride>,

    /// Replacement for the built-in overview query template (must bind exactly one key parameter)
    #[arg(long, env = "LOOKUP_OVERVIEW_QUERY")]
    pub overview_query: Option<String>,

    /// Skip the startup check that every mapped column exists
    #[arg(long, env = "LOOKUP_SKIP_SCHEMA_CHECK")]
    pub skip_schema_check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOOKUP_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "LOOKUP_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database_url: String::new(),
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            max_sections: DEFAULT_MAX_SECTIONS,
            max_section_bytes: DEFAULT_MAX_SECTION_BYTES,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            auth_mode: AuthMode::Token,
            access_token: None,
            token_file: None,
            token_command: None,
            sections: Vec::new(),
            overview_query: None,
            skip_schema_check: false,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate settings that clap cannot check on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.trim().is_empty() {
            return Err("LOOKUP_DATABASE_URL is required".to_string());
        }
        if self.max_sections == 0 {
            return Err("max_sections must be greater than 0".to_string());
        }
        if self.max_section_bytes > self.max_response_bytes {
            return Err(format!(
                "max_section_bytes ({}) cannot exceed max_response_bytes ({})",
                self.max_section_bytes, self.max_response_bytes
            ));
        }
        if let Some(query) = &self.overview_query {
            if query.trim().is_empty() {
                return Err("overview_query must not be empty when set".to_string());
            }
        }
        Ok(())
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            acquire_timeout: (self.acquire_timeout_secs > 0)
                .then(|| Duration::from_secs(self.acquire_timeout_secs)),
        }
    }

    /// Response guardrails derived from this configuration.
    pub fn guardrails(&self) -> Guardrails {
        Guardrails {
            max_sections: self.max_sections,
            max_section_bytes: self.max_section_bytes,
            max_total_bytes: self.max_response_bytes,
        }
    }

    /// Get the connection timeout as a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Database URL with any password masked, for logging.
    pub fn masked_database_url(&self) -> String {
        match Url::parse(&self.database_url) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<unparseable url>".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
