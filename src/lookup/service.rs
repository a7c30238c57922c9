//! The submission lookup request boundary.
//!
//! A lookup runs acquire → resolve → validate sections → dispatch → release on a
//! single checked-out connection, timing each phase. [`SubmissionLookup::fetch`]
//! returns typed results; [`SubmissionLookup::lookup`] converts every outcome,
//! including failures, into a [`LookupResponse`] and never fails itself.

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::db::{DbConnection, DbPool, SqlConnector};
use crate::error::{ErrorKind, LookupError, LookupResult};
use crate::lookup::dispatcher::{Guardrails, QueryDispatcher};
use crate::lookup::identifier::{IdentifierKind, IdentifierResolver, SubmissionIdentifier};
use crate::lookup::schema::LookupSchema;
use crate::lookup::sections::{OVERVIEW_SECTION, SectionCatalog};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Input for a submission lookup.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LookupRequest {
    /// Identifier kind: "friendly_id", "convr_id" or "internal_id"
    #[serde(default)]
    pub identifier_type: String,
    /// Identifier value, e.g. "SPARK-12345"
    #[serde(default)]
    pub identifier_value: String,
    /// Sections to fetch. Omit for ["overview"]. Call list_sections for the allowed names.
    #[serde(default)]
    pub sections: Option<Vec<String>>,
}

impl LookupRequest {
    pub fn new(identifier_type: impl Into<String>, identifier_value: impl Into<String>) -> Self {
        Self {
            identifier_type: identifier_type.into(),
            identifier_value: identifier_value.into(),
            sections: None,
        }
    }

    pub fn with_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sections = Some(sections.into_iter().map(Into::into).collect());
        self
    }
}

/// Phase timings in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, JsonSchema)]
pub struct QueryMetrics {
    /// Time spent waiting for a pooled connection
    pub connection_ms: f64,
    /// Time spent resolving the identifier and fetching sections
    pub query_ms: f64,
    /// Wall time for the whole lookup
    pub tool_total_ms: f64,
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 100_000.0).round() / 100.0
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub submission_id: i64,
    pub sections: BTreeMap<String, JsonValue>,
    pub metrics: QueryMetrics,
}

/// A failed lookup, with the key if resolution got that far.
#[derive(Debug)]
pub struct LookupFailure {
    pub error: LookupError,
    pub submission_id: Option<i64>,
    pub metrics: QueryMetrics,
}

/// Response returned to callers. `found` tells success from failure.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct LookupResponse {
    /// True when the submission was resolved and every section fetched
    pub found: bool,
    /// Internal submission key, when resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<i64>,
    /// Section name to data (success only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<BTreeMap<String, JsonValue>>,
    /// Failure message safe to show to users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Hint for fixing the request, when one applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Echo of the requested identifier kind (failure only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_type: Option<String>,
    /// Echo of the requested identifier value (failure only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_value: Option<String>,
    pub metrics: QueryMetrics,
}

impl LookupResponse {
    fn success(outcome: LookupOutcome) -> Self {
        Self {
            found: true,
            submission_id: Some(outcome.submission_id),
            sections: Some(outcome.sections),
            error: None,
            error_kind: None,
            suggestion: None,
            identifier_type: None,
            identifier_value: None,
            metrics: outcome.metrics,
        }
    }

    fn failure(request: &LookupRequest, failure: LookupFailure) -> Self {
        Self {
            found: false,
            submission_id: failure.submission_id,
            sections: None,
            error: Some(failure.error.public_message()),
            error_kind: Some(failure.error.kind()),
            suggestion: failure.error.suggestion().map(String::from),
            identifier_type: Some(request.identifier_type.clone()),
            identifier_value: Some(request.identifier_value.clone()),
            metrics: failure.metrics,
        }
    }
}

/// Allowed sections and limits, for discovery.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct SectionsInfo {
    /// Every section name a request may use
    pub sections: Vec<String>,
    /// Section returned when none are requested
    pub default_section: String,
    /// Valid identifier_type values
    pub identifier_types: Vec<String>,
    /// Maximum sections per request
    pub max_sections: usize,
    /// Maximum serialized bytes per section
    pub max_section_bytes: usize,
    /// Maximum serialized bytes for all sections together
    pub max_response_bytes: usize,
}

/// Resolves submissions and fetches their sections over a shared pool.
#[derive(Debug, Clone)]
pub struct SubmissionLookup {
    pool: Arc<DbPool>,
    catalog: Arc<SectionCatalog>,
    resolver: IdentifierResolver,
    dispatcher: QueryDispatcher,
}

impl SubmissionLookup {
    pub fn new(
        pool: Arc<DbPool>,
        catalog: Arc<SectionCatalog>,
        resolver: IdentifierResolver,
        dispatcher: QueryDispatcher,
    ) -> Self {
        Self {
            pool,
            catalog,
            resolver,
            dispatcher,
        }
    }

    /// Wire up the provider, pool, allowlist and query layers from configuration.
    ///
    /// Opens no connections.
    pub fn from_config(config: &Config) -> LookupResult<Self> {
        config.validate().map_err(LookupError::configuration)?;

        let schema = LookupSchema::default();
        schema.validate()?;
        let catalog = Arc::new(SectionCatalog::from_overrides(&config.sections)?);

        let credentials = CredentialProvider::from_config(config);
        let connector = SqlConnector::new(&config.database_url, config.connect_timeout_duration())?;
        let pool = Arc::new(DbPool::new(connector, credentials, config.pool_config()));

        let resolver = IdentifierResolver::new(schema.clone(), config.query_timeout_duration());
        let mut dispatcher = QueryDispatcher::new(
            catalog.clone(),
            schema,
            config.guardrails(),
            config.query_timeout_duration(),
        );
        if let Some(sql) = &config.overview_query {
            dispatcher = dispatcher.with_overview_query(sql.clone());
        }

        Ok(Self::new(pool, catalog, resolver, dispatcher))
    }

    pub fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }

    pub fn catalog(&self) -> &SectionCatalog {
        &self.catalog
    }

    fn guardrails(&self) -> &Guardrails {
        self.dispatcher.guardrails()
    }

    pub fn sections_info(&self) -> SectionsInfo {
        let guardrails = self.guardrails();
        SectionsInfo {
            sections: self.catalog.allowed_names(),
            default_section: OVERVIEW_SECTION.to_string(),
            identifier_types: IdentifierKind::ALL
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            max_sections: guardrails.max_sections,
            max_section_bytes: guardrails.max_section_bytes,
            max_response_bytes: guardrails.max_total_bytes,
        }
    }

    /// Check the allowlist and identifier columns against the live schema.
    pub async fn verify_schema(&self) -> LookupResult<()> {
        let (mut conn, _) = self.pool.acquire().await?;
        let result = async {
            self.resolver.verify_schema(&mut conn).await?;
            self.dispatcher.verify_schema(&mut conn).await
        }
        .await;
        conn.release(result.is_err()).await;
        result
    }

    /// Run a lookup, returning typed success or failure.
    pub async fn fetch(&self, request: &LookupRequest) -> Result<LookupOutcome, LookupFailure> {
        let span = info_span!(
            "lookup",
            request_id = %Uuid::new_v4(),
            identifier_type = %request.identifier_type,
            identifier_value = %request.identifier_value,
        );
        self.fetch_inner(request).instrument(span).await
    }

    async fn fetch_inner(&self, request: &LookupRequest) -> Result<LookupOutcome, LookupFailure> {
        let started = Instant::now();
        let mut metrics = QueryMetrics::default();

        let fail = |error: LookupError, submission_id: Option<i64>, mut metrics: QueryMetrics| {
            metrics.tool_total_ms = millis(started.elapsed());
            if error.taints_connection() || error.is_retryable() {
                warn!(kind = ?error.kind(), error = %error, "Lookup failed");
            } else {
                info!(kind = ?error.kind(), error = %error, "Lookup rejected");
            }
            LookupFailure {
                error,
                submission_id,
                metrics,
            }
        };

        // Unknown kinds and empty values never reach the pool.
        let identifier =
            match SubmissionIdentifier::parse(&request.identifier_type, &request.identifier_value) {
                Ok(identifier) => identifier,
                Err(e) => return Err(fail(e, None, metrics)),
            };

        let (mut conn, waited) = match self.pool.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                metrics.connection_ms = millis(started.elapsed());
                return Err(fail(e, None, metrics));
            }
        };
        metrics.connection_ms = millis(waited);

        let query_started = Instant::now();
        let result = self
            .resolve_and_dispatch(&identifier, request.sections.as_deref(), &mut conn)
            .await;
        metrics.query_ms = millis(query_started.elapsed());

        let had_error = matches!(&result, Err((_, e)) if e.taints_connection());
        conn.release(had_error).await;

        match result {
            Ok((submission_id, sections)) => {
                metrics.tool_total_ms = millis(started.elapsed());
                info!(
                    submission_id,
                    sections = ?sections.keys().collect::<Vec<_>>(),
                    connection_ms = metrics.connection_ms,
                    query_ms = metrics.query_ms,
                    total_ms = metrics.tool_total_ms,
                    "Lookup completed"
                );
                Ok(LookupOutcome {
                    submission_id,
                    sections,
                    metrics,
                })
            }
            Err((submission_id, e)) => Err(fail(e, submission_id, metrics)),
        }
    }

    async fn resolve_and_dispatch(
        &self,
        identifier: &SubmissionIdentifier,
        sections: Option<&[String]>,
        conn: &mut DbConnection,
    ) -> Result<(i64, BTreeMap<String, JsonValue>), (Option<i64>, LookupError)> {
        let key = match self.resolver.resolve(identifier, conn).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                return Err((
                    None,
                    LookupError::identifier_not_found(
                        identifier.kind.as_str(),
                        identifier.value.clone(),
                    ),
                ));
            }
            Err(e) => return Err((None, e)),
        };
        info!(submission_id = key, "Identifier resolved");

        let request = self
            .catalog
            .validate(sections, self.guardrails().max_sections)
            .map_err(|e| (Some(key), e))?;

        let sections = self
            .dispatcher
            .dispatch(key, &request, conn)
            .await
            .map_err(|e| (Some(key), e))?;
        Ok((key, sections))
    }

    /// Run a lookup and shape the result for callers. Never fails.
    pub async fn lookup(&self, request: &LookupRequest) -> LookupResponse {
        match self.fetch(request).await {
            Ok(outcome) => LookupResponse::success(outcome),
            Err(failure) => LookupResponse::failure(request, failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_millis_rounding() {
        assert_eq!(millis(Duration::from_micros(1234)), 1.23);
        assert_eq!(millis(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_request_deserializes_without_sections() {
        let request: LookupRequest = serde_json::from_value(json!({
            "identifier_type": "friendly_id",
            "identifier_value": "SPARK-12345"
        }))
        .unwrap();
        assert!(request.sections.is_none());
    }

    #[test]
    fn test_missing_fields_fail_through_validation() {
        let request: LookupRequest = serde_json::from_value(json!({
            "identifier_type": "friendly_id"
        }))
        .unwrap();
        let err = SubmissionIdentifier::parse(&request.identifier_type, &request.identifier_value)
            .unwrap_err();
        assert!(matches!(err, LookupError::EmptyIdentifierValue));

        let request: LookupRequest = serde_json::from_value(json!({})).unwrap();
        let err = SubmissionIdentifier::parse(&request.identifier_type, &request.identifier_value)
            .unwrap_err();
        assert!(matches!(err, LookupError::UnsupportedIdentifierKind { .. }));
    }

    #[test]
    fn test_failure_response_shape() {
        let request = LookupRequest::new("friendly_id", "NOPE-1");
        let response = LookupResponse::failure(
            &request,
            LookupFailure {
                error: LookupError::identifier_not_found("friendly_id", "NOPE-1"),
                submission_id: None,
                metrics: QueryMetrics::default(),
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["found"], json!(false));
        assert_eq!(value["error_kind"], json!("identifier_not_found"));
        assert_eq!(value["identifier_value"], json!("NOPE-1"));
        assert!(value.get("submission_id").is_none());
        assert!(value.get("sections").is_none());
        assert!(value["metrics"].get("tool_total_ms").is_some());
    }

    #[test]
    fn test_failure_response_hides_database_detail() {
        let request = LookupRequest::new("friendly_id", "SPARK-1");
        let response = LookupResponse::failure(
            &request,
            LookupFailure {
                error: LookupError::database("relation \"uw_secret\" does not exist", None),
                submission_id: Some(7),
                metrics: QueryMetrics::default(),
            },
        );
        assert_eq!(response.submission_id, Some(7));
        assert!(!response.error.unwrap().contains("uw_secret"));
    }

    #[test]
    fn test_success_response_shape() {
        let mut sections = BTreeMap::new();
        sections.insert("overview".to_string(), json!({"submission_id": 123}));
        let response = LookupResponse::success(LookupOutcome {
            submission_id: 123,
            sections,
            metrics: QueryMetrics::default(),
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["found"], json!(true));
        assert_eq!(value["submission_id"], json!(123));
        assert_eq!(value["sections"]["overview"]["submission_id"], json!(123));
        assert!(value.get("error").is_none());
    }
}
