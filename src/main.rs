//! Submission Lookup MCP Server - Main entry point.
//!
//! Resolves submission identifiers and serves allowlisted detail sections to
//! AI assistants over MCP stdio.

use clap::Parser;
use std::sync::Arc;
use submission_lookup::config::Config;
use submission_lookup::lookup::SubmissionLookup;
use submission_lookup::transport::{StdioTransport, Transport};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr: stdout carries the MCP protocol.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine; the environment may already be populated.
    let dotenv = dotenvy::dotenv();

    let config = Config::parse();
    init_tracing(&config);

    if let Err(e) = &dotenv {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }

    if let Err(message) = config.validate() {
        eprintln!("Error: {}", message);
        eprintln!();
        eprintln!("Usage: submission-lookup --database-url <url>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  LOOKUP_DATABASE_URL=postgres://lookup_reader@db.internal:5432/uw submission-lookup");
        eprintln!("  submission-lookup --database-url sqlite:submissions.db --auth-mode none");
        std::process::exit(1);
    }

    info!(
        database = %config.masked_database_url(),
        auth_mode = %config.auth_mode,
        pool_max_size = config.pool_max_size,
        token_ttl_secs = config.token_ttl_secs,
        "Starting Submission Lookup v{}",
        env!("CARGO_PKG_VERSION")
    );

    let lookup = Arc::new(SubmissionLookup::from_config(&config)?);

    if config.skip_schema_check {
        warn!("Schema check skipped; unmapped columns will surface as lookup errors");
    } else {
        lookup.verify_schema().await.inspect_err(|e| {
            error!(error = %e, "Schema check failed");
        })?;
        info!(
            sections = ?lookup.catalog().allowed_names(),
            "Section allowlist verified against the database"
        );
    }

    let transport = StdioTransport::new(lookup);
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
