//! Submission identifiers and their resolution to the internal key.

use crate::db::{DbConnection, QueryParam};
use crate::error::{LookupError, LookupResult};
use crate::lookup::schema::LookupSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Which external identifier a caller supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Human-facing reference such as `SPARK-12345`
    FriendlyId,
    /// Identifier assigned by the upstream intake system
    ConvrId,
    /// Internal primary key
    InternalId,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 3] = [Self::FriendlyId, Self::ConvrId, Self::InternalId];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FriendlyId => "friendly_id",
            Self::ConvrId => "convr_id",
            Self::InternalId => "internal_id",
        }
    }

    fn column(self, schema: &LookupSchema) -> &str {
        match self {
            Self::FriendlyId => &schema.friendly_id_column,
            Self::ConvrId => &schema.convr_id_column,
            Self::InternalId => &schema.key_column,
        }
    }
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                LookupError::unsupported_identifier_kind(
                    s,
                    Self::ALL.iter().map(|kind| kind.as_str()),
                )
            })
    }
}

/// A validated `(kind, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionIdentifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl SubmissionIdentifier {
    /// Validate raw request fields. The kind is checked before the value.
    pub fn parse(kind: &str, value: &str) -> LookupResult<Self> {
        let kind = kind.parse::<IdentifierKind>()?;
        let value = value.trim();
        if value.is_empty() {
            return Err(LookupError::EmptyIdentifierValue);
        }
        Ok(Self {
            kind,
            value: value.to_string(),
        })
    }
}

/// Maps identifiers to internal keys with one point lookup.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    schema: LookupSchema,
    query_timeout: Duration,
}

impl IdentifierResolver {
    pub fn new(schema: LookupSchema, query_timeout: Duration) -> Self {
        Self {
            schema,
            query_timeout,
        }
    }

    fn lookup_sql(&self, conn: &DbConnection, kind: IdentifierKind) -> String {
        let db_type = conn.db_type();
        // LIMIT 2 is enough to tell unique from ambiguous.
        format!(
            "SELECT {key} AS submission_key FROM {table} WHERE {column} = {param} LIMIT 2",
            key = db_type.quote_ident(&self.schema.key_column),
            table = db_type.quote_ident(&self.schema.submissions_table),
            column = db_type.quote_ident(kind.column(&self.schema)),
            param = db_type.placeholder(1),
        )
    }

    /// Resolve to the internal key, or `None` when nothing matches.
    ///
    /// A non-numeric `internal_id` cannot match any key and is answered
    /// without touching the database.
    pub async fn resolve(
        &self,
        identifier: &SubmissionIdentifier,
        conn: &mut DbConnection,
    ) -> LookupResult<Option<i64>> {
        let param = match identifier.kind {
            IdentifierKind::InternalId => match identifier.value.parse::<i64>() {
                Ok(key) => QueryParam::Int(key),
                Err(_) => {
                    debug!(value = %identifier.value, "internal_id is not an integer");
                    return Ok(None);
                }
            },
            _ => QueryParam::String(identifier.value.clone()),
        };

        let sql = self.lookup_sql(conn, identifier.kind);
        let rows = conn.fetch_rows(&sql, &[param], self.query_timeout).await?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => extract_key(row.get("submission_key")).map(Some),
            _ => Err(LookupError::ambiguous_identifier(
                identifier.kind.as_str(),
                identifier.value.clone(),
            )),
        }
    }

    /// Check that the submissions table has every column the resolver reads.
    pub async fn verify_schema(&self, conn: &mut DbConnection) -> LookupResult<()> {
        let db_type = conn.db_type();
        let columns = [
            &self.schema.key_column,
            &self.schema.friendly_id_column,
            &self.schema.convr_id_column,
        ]
        .iter()
        .map(|c| db_type.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE 1 = 0",
            columns,
            db_type.quote_ident(&self.schema.submissions_table)
        );
        conn.fetch_rows(&sql, &[], self.query_timeout)
            .await
            .map(|_| ())
            .map_err(|e| {
                LookupError::configuration(format!(
                    "Table '{}' is missing identifier columns: {}",
                    self.schema.submissions_table, e
                ))
            })
    }
}

fn extract_key(value: Option<&JsonValue>) -> LookupResult<i64> {
    let key = match value {
        Some(JsonValue::Number(n)) => n.as_i64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    key.ok_or_else(|| LookupError::internal(format!("Resolved key is not an integer: {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(
            "friendly_id".parse::<IdentifierKind>().unwrap(),
            IdentifierKind::FriendlyId
        );
        assert_eq!(
            " CONVR_ID ".parse::<IdentifierKind>().unwrap(),
            IdentifierKind::ConvrId
        );
        assert_eq!(
            "internal_id".parse::<IdentifierKind>().unwrap(),
            IdentifierKind::InternalId
        );
    }

    #[test]
    fn test_unknown_kind_lists_valid_kinds() {
        let err = "policy_number".parse::<IdentifierKind>().unwrap_err();
        assert!(matches!(err, LookupError::UnsupportedIdentifierKind { .. }));
        let msg = err.to_string();
        assert!(msg.contains("friendly_id, convr_id, internal_id"));
    }

    #[test]
    fn test_identifier_kind_checked_before_value() {
        let err = SubmissionIdentifier::parse("bogus", "").unwrap_err();
        assert!(matches!(err, LookupError::UnsupportedIdentifierKind { .. }));

        let err = SubmissionIdentifier::parse("friendly_id", "   ").unwrap_err();
        assert!(matches!(err, LookupError::EmptyIdentifierValue));
    }

    #[test]
    fn test_identifier_value_is_trimmed() {
        let id = SubmissionIdentifier::parse("friendly_id", "  SPARK-12345 ").unwrap();
        assert_eq!(id.value, "SPARK-12345");
    }

    #[test]
    fn test_extract_key() {
        assert_eq!(extract_key(Some(&json!(123))).unwrap(), 123);
        assert_eq!(extract_key(Some(&json!("123"))).unwrap(), 123);
        assert!(extract_key(Some(&json!("abc"))).is_err());
        assert!(extract_key(None).is_err());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&IdentifierKind::InternalId).unwrap(),
            "\"internal_id\""
        );
    }
}
