//! Transport layer for the MCP server.
//!
//! Only stdio is provided: the server runs as a child process of the agent host.

pub mod stdio;

pub use stdio::StdioTransport;

use crate::error::LookupResult;
use std::future::Future;

/// Trait for MCP transport implementations.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = LookupResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
