//! MCP service implementation using rmcp.
//!
//! This module defines the LookupServer struct with the submission lookup
//! tools exposed via the MCP protocol using the rmcp framework's macros.

use crate::db::PoolStatus;
use crate::lookup::{LookupRequest, LookupResponse, SectionsInfo, SubmissionLookup};
use rmcp::Json;
use rmcp::{
    ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct LookupServer {
    /// Shared lookup service (pool, allowlist, resolver, dispatcher)
    lookup: Arc<SubmissionLookup>,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
}

impl LookupServer {
    pub fn new(lookup: Arc<SubmissionLookup>) -> Self {
        Self {
            lookup,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl LookupServer {
    #[tool(
        description = "Fetch submission details by identifier.\nidentifier_type is one of friendly_id, convr_id or internal_id.\nsections defaults to [\"overview\"]; call list_sections for the allowed names.\nAlways returns an object: check `found`, and on failure read `error` and `error_kind`."
    )]
    async fn get_submission_details(
        &self,
        Parameters(input): Parameters<LookupRequest>,
    ) -> Json<LookupResponse> {
        Json(self.lookup.lookup(&input).await)
    }

    #[tool(
        description = "List the section names get_submission_details accepts, the default section, valid identifier types and the size limits."
    )]
    async fn list_sections(&self) -> Json<SectionsInfo> {
        Json(self.lookup.sections_info())
    }

    #[tool(
        description = "Show connection pool occupancy (live, idle, in use) and lifetime counters."
    )]
    async fn pool_status(&self) -> Json<PoolStatus> {
        Json(self.lookup.pool().status())
    }
}

#[tool_handler]
impl ServerHandler for LookupServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "submission-lookup".to_owned(),
                title: Some("Submission Lookup".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Read-only lookup of insurance submissions.\n\
                \n\
                ## Workflow\n\
                1. Call `list_sections` to see which sections can be requested\n\
                2. Call `get_submission_details` with an identifier and the sections you need\n\
                \n\
                ## Identifiers\n\
                - `friendly_id`: human-facing reference, e.g. SPARK-12345\n\
                - `convr_id`: identifier from the intake system\n\
                - `internal_id`: numeric internal key\n\
                \n\
                ## Results\n\
                - `found: true` carries `submission_id` and a `sections` object keyed by section name\n\
                - `found: false` carries `error` and `error_kind`; nothing is retried automatically\n\
                - Requests over the section or size limits are rejected, never truncated; ask for fewer sections"
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, Config};

    fn create_test_server() -> LookupServer {
        let config = Config {
            database_url: "sqlite:unused.db".to_string(),
            auth_mode: AuthMode::None,
            ..Config::default()
        };
        let lookup = SubmissionLookup::from_config(&config).unwrap();
        LookupServer::new(Arc::new(lookup))
    }

    #[test]
    fn test_server_info() {
        let server = create_test_server();
        let info = server.get_info();
        assert_eq!(info.server_info.name, "submission-lookup");
        assert!(info.capabilities.tools.is_some());
    }

    #[tokio::test]
    async fn test_list_sections_tool() {
        let server = create_test_server();
        let Json(info) = server.list_sections().await;
        assert!(info.sections.contains(&"overview".to_string()));
        assert_eq!(info.default_section, "overview");
        assert_eq!(info.identifier_types.len(), 3);
    }

    #[tokio::test]
    async fn test_pool_status_starts_empty() {
        let server = create_test_server();
        let Json(status) = server.pool_status().await;
        assert_eq!(status.live, 0);
        assert_eq!(status.max_size, 5);
    }

    #[tokio::test]
    async fn test_unknown_identifier_type_never_touches_pool() {
        let server = create_test_server();
        let request = LookupRequest::new("policy_number", "P-1");
        let Json(response) = server.get_submission_details(Parameters(request)).await;
        assert!(!response.found);
        assert_eq!(
            response.error_kind,
            Some(crate::error::ErrorKind::UnsupportedIdentifierKind)
        );
        assert_eq!(server.lookup.pool().status().total_created, 0);
    }

    #[tokio::test]
    async fn test_omitted_identifier_value_is_a_lookup_failure() {
        let server = create_test_server();
        let request: LookupRequest =
            serde_json::from_value(serde_json::json!({"identifier_type": "friendly_id"})).unwrap();
        let Json(response) = server.get_submission_details(Parameters(request)).await;
        assert!(!response.found);
        assert_eq!(
            response.error_kind,
            Some(crate::error::ErrorKind::EmptyIdentifierValue)
        );
        assert_eq!(response.identifier_value.as_deref(), Some(""));
    }
}
