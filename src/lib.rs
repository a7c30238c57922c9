//! Submission Lookup Library
//!
//! This library resolves submission identifiers to internal keys and fetches
//! allowlisted detail sections over a pool of token-authenticated database
//! connections (SQLite, PostgreSQL, MySQL), exposed as MCP tools.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod lookup;
pub mod mcp;
pub mod transport;

pub use config::Config;
pub use error::{LookupError, LookupResult};
pub use lookup::{LookupRequest, LookupResponse, SubmissionLookup};
pub use mcp::LookupServer;
