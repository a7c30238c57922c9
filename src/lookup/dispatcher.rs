//! Guarded section fetches.
//!
//! The dispatcher turns a validated [`SectionRequest`] into at most two
//! statements on the caller's connection: the overview template and one
//! `SELECT` of the mapped columns. Every identifier in those statements comes
//! from the [`SectionCatalog`] or [`LookupSchema`]; the key is always bound.
//! Results are measured against the [`Guardrails`] before they are returned and
//! are never truncated.

use crate::config::{DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_MAX_SECTION_BYTES, DEFAULT_MAX_SECTIONS};
use crate::db::{DatabaseType, DbConnection, JsonRow, QueryParam};
use crate::error::{LookupError, LookupResult};
use crate::lookup::schema::LookupSchema;
use crate::lookup::sections::{OVERVIEW_SECTION, SectionCatalog, SectionRequest};
use humansize::{BINARY, format_size};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Limits enforced before any section leaves the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guardrails {
    pub max_sections: usize,
    pub max_section_bytes: usize,
    pub max_total_bytes: usize,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_sections: DEFAULT_MAX_SECTIONS,
            max_section_bytes: DEFAULT_MAX_SECTION_BYTES,
            max_total_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl Guardrails {
    /// Reject oversized sections, or the whole response when the sum is too large.
    pub fn check(&self, sections: &BTreeMap<String, JsonValue>) -> LookupResult<usize> {
        let mut sizes: Vec<(&str, usize)> = sections
            .iter()
            .map(|(name, value)| (name.as_str(), serialized_len(value)))
            .collect();

        let oversized: Vec<(&str, usize)> = sizes
            .iter()
            .copied()
            .filter(|(_, size)| *size > self.max_section_bytes)
            .collect();
        if !oversized.is_empty() {
            let detail = oversized
                .iter()
                .map(|(name, size)| format!("{} is {}", name, format_size(*size, BINARY)))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(LookupError::payload_too_large(
                oversized.iter().map(|(name, _)| name.to_string()).collect(),
                format!(
                    "{} (per-section limit {})",
                    detail,
                    format_size(self.max_section_bytes, BINARY)
                ),
            ));
        }

        let total: usize = sizes.iter().map(|(_, size)| size).sum();
        if total > self.max_total_bytes {
            sizes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            return Err(LookupError::payload_too_large(
                sizes.iter().map(|(name, _)| name.to_string()).collect(),
                format!(
                    "combined size {} exceeds response limit {}",
                    format_size(total, BINARY),
                    format_size(self.max_total_bytes, BINARY)
                ),
            ));
        }

        Ok(total)
    }
}

fn serialized_len(value: &JsonValue) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Structured text stored in a column is returned as structured data.
fn normalize_section_value(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            } else {
                JsonValue::String(text)
            }
        }
        other => other,
    }
}

/// Builds and runs the statements for a section request.
#[derive(Debug, Clone)]
pub struct QueryDispatcher {
    catalog: Arc<SectionCatalog>,
    schema: LookupSchema,
    overview_sql: Option<String>,
    guardrails: Guardrails,
    query_timeout: Duration,
}

impl QueryDispatcher {
    pub fn new(
        catalog: Arc<SectionCatalog>,
        schema: LookupSchema,
        guardrails: Guardrails,
        query_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            schema,
            overview_sql: None,
            guardrails,
            query_timeout,
        }
    }

    /// Replace the built-in overview template. It must bind exactly one key parameter.
    pub fn with_overview_query(mut self, sql: impl Into<String>) -> Self {
        self.overview_sql = Some(sql.into());
        self
    }

    pub fn guardrails(&self) -> &Guardrails {
        &self.guardrails
    }

    fn overview_sql(&self, db_type: DatabaseType) -> String {
        self.overview_sql
            .clone()
            .unwrap_or_else(|| self.schema.overview_template(db_type))
    }

    /// `SELECT <key>, <columns…> FROM <details> WHERE <key> = <param>`
    fn section_sql(&self, db_type: DatabaseType, columns: &[&str]) -> String {
        let key = db_type.quote_ident(&self.schema.details_key_column);
        let selected = std::iter::once(key.clone())
            .chain(columns.iter().map(|c| db_type.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            selected,
            db_type.quote_ident(&self.schema.details_table),
            key,
            db_type.placeholder(1)
        )
    }

    /// Fetch every requested section for `key`.
    pub async fn dispatch(
        &self,
        key: i64,
        request: &SectionRequest,
        conn: &mut DbConnection,
    ) -> LookupResult<BTreeMap<String, JsonValue>> {
        let db_type = conn.db_type();
        let params = [QueryParam::Int(key)];
        let mut sections = BTreeMap::new();

        if request.includes_overview() {
            let sql = self.overview_sql(db_type);
            let row = self.fetch_one(conn, &sql, &params, key).await?;
            sections.insert(OVERVIEW_SECTION.to_string(), JsonValue::Object(row));
        }

        let wanted: Vec<(&str, &str)> = request
            .column_sections()
            .filter_map(|name| self.catalog.column(name).map(|column| (name, column)))
            .collect();

        if !wanted.is_empty() {
            let mut columns: Vec<&str> = wanted.iter().map(|(_, column)| *column).collect();
            columns.sort_unstable();
            columns.dedup();

            let sql = self.section_sql(db_type, &columns);
            let row = self.fetch_one(conn, &sql, &params, key).await?;
            for (name, column) in wanted {
                let value = row.get(column).cloned().unwrap_or(JsonValue::Null);
                sections.insert(name.to_string(), normalize_section_value(value));
            }
        }

        let total = self.guardrails.check(&sections)?;
        debug!(
            submission_id = key,
            sections = sections.len(),
            size = %format_size(total, BINARY),
            "Sections fetched"
        );
        Ok(sections)
    }

    async fn fetch_one(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        params: &[QueryParam],
        key: i64,
    ) -> LookupResult<JsonRow> {
        let rows = conn.fetch_rows(sql, params, self.query_timeout).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(row),
            None => {
                error!(
                    submission_id = key,
                    "Submission resolved but its detail record is missing"
                );
                Err(LookupError::DetailsNotFound { submission_id: key })
            }
        }
    }

    /// Check that every mapped column exists and the overview template runs.
    pub async fn verify_schema(&self, conn: &mut DbConnection) -> LookupResult<()> {
        let db_type = conn.db_type();
        let columns = self.catalog.columns();
        let sql = format!(
            "{} AND 1 = 0",
            self.section_sql(db_type, &columns)
        );
        conn.fetch_rows(&sql, &[QueryParam::Int(0)], self.query_timeout)
            .await
            .map_err(|e| {
                LookupError::configuration(format!(
                    "Section columns [{}] are not all present in '{}': {}",
                    columns.join(", "),
                    self.schema.details_table,
                    e
                ))
            })?;

        // No key is negative, so this only proves the template compiles.
        conn.fetch_rows(
            &self.overview_sql(db_type),
            &[QueryParam::Int(-1)],
            self.query_timeout,
        )
        .await
        .map_err(|e| LookupError::configuration(format!("Overview query is invalid: {}", e)))?;
        Ok(())
    }
}
