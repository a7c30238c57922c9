//! Stdio transport for the MCP server.
//!
//! This transport uses standard input/output for communication,
//! which is the standard mode for CLI-based MCP integrations.

use crate::error::{LookupError, LookupResult};
use crate::lookup::SubmissionLookup;
use crate::mcp::LookupServer;
use crate::transport::Transport;
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Stdio transport implementation.
///
/// This transport reads JSON-RPC messages from stdin and writes
/// responses to stdout as MCP JSON-RPC.
pub struct StdioTransport {
    lookup: Arc<SubmissionLookup>,
}

impl StdioTransport {
    pub fn new(lookup: Arc<SubmissionLookup>) -> Self {
        Self { lookup }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> LookupResult<()> {
        info!("Starting MCP server with stdio transport");

        let server = LookupServer::new(self.lookup.clone());

        let running_service = server.serve(stdio()).await.map_err(|e| {
            LookupError::internal(format!("Failed to start stdio transport: {}", e))
        })?;

        let shutdown_requested = tokio::select! {
            result = running_service.waiting() => {
                match result {
                    Ok(_quit_reason) => {
                        info!("Stdio transport completed normally");
                    }
                    Err(e) => {
                        warn!(error = %e, "Stdio transport error");
                        return Err(LookupError::internal(format!(
                            "Stdio transport error: {}",
                            e
                        )));
                    }
                }
                false
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                true
            }
        };

        if shutdown_requested {
            // Spawn a task to listen for second signal and force exit
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        info!(status = ?self.lookup.pool().status(), "Closing pooled connections");
        self.lookup.pool().close().await;

        if shutdown_requested {
            // tokio::select! cannot interrupt blocking stdin reads
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
///
/// If a handler cannot be installed that signal is simply never observed.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, Config};

    #[test]
    fn test_stdio_transport_creation() {
        let config = Config {
            database_url: "sqlite:unused.db".to_string(),
            auth_mode: AuthMode::None,
            ..Config::default()
        };
        let lookup = Arc::new(SubmissionLookup::from_config(&config).unwrap());
        let transport = StdioTransport::new(lookup);
        assert_eq!(transport.name(), "stdio");
    }
}
