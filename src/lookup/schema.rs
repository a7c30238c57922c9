//! Physical layout of the submission tables.
//!
//! Table and column names here are the only identifiers, besides the section
//! allowlist, that are ever written into SQL text. They are checked with
//! [`validate_identifier`] before use.

use crate::db::DatabaseType;
use crate::error::{LookupError, LookupResult};

/// Tables and columns the resolver and dispatcher read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSchema {
    pub submissions_table: String,
    pub key_column: String,
    pub friendly_id_column: String,
    pub convr_id_column: String,
    pub details_table: String,
    pub details_key_column: String,
}

impl Default for LookupSchema {
    fn default() -> Self {
        Self {
            submissions_table: "submissions".to_string(),
            key_column: "id".to_string(),
            friendly_id_column: "friendly_id".to_string(),
            convr_id_column: "convr_id".to_string(),
            details_table: "submission_details".to_string(),
            details_key_column: "submission_id".to_string(),
        }
    }
}

impl LookupSchema {
    /// Check every identifier. Table names may be schema-qualified.
    pub fn validate(&self) -> LookupResult<()> {
        validate_identifier(&self.submissions_table, true)?;
        validate_identifier(&self.details_table, true)?;
        for column in [
            &self.key_column,
            &self.friendly_id_column,
            &self.convr_id_column,
            &self.details_key_column,
        ] {
            validate_identifier(column, false)?;
        }
        Ok(())
    }

    /// The built-in overview template for `db_type`.
    ///
    /// Joins the submission row to its detail row and lifts a few headline
    /// fields out of the structured-text columns. Binds the key exactly once.
    pub fn overview_template(&self, db_type: DatabaseType) -> String {
        let q = |ident: &str| db_type.quote_ident(ident);
        let s = q(&self.submissions_table);
        let d = q(&self.details_table);
        let key = q(&self.key_column);
        let dkey = q(&self.details_key_column);

        let (insured_name, line_of_business, state) = match db_type {
            DatabaseType::Postgres => (
                "(d.insured_json::json ->> 'name')".to_string(),
                "(d.coverages_json::json ->> 'line_of_business')".to_string(),
                "(d.insured_json::json ->> 'state')".to_string(),
            ),
            DatabaseType::MySql => (
                "JSON_UNQUOTE(JSON_EXTRACT(d.insured_json, '$.name'))".to_string(),
                "JSON_UNQUOTE(JSON_EXTRACT(d.coverages_json, '$.line_of_business'))".to_string(),
                "JSON_UNQUOTE(JSON_EXTRACT(d.insured_json, '$.state'))".to_string(),
            ),
            DatabaseType::SQLite => (
                "json_extract(d.insured_json, '$.name')".to_string(),
                "json_extract(d.coverages_json, '$.line_of_business')".to_string(),
                "json_extract(d.insured_json, '$.state')".to_string(),
            ),
        };

        format!(
            "SELECT s.{key} AS submission_id, s.{friendly} AS friendly_id, s.{convr} AS convr_id, \
             s.status AS status, s.created_at AS created_at, \
             {insured_name} AS insured_name, {state} AS insured_state, \
             {line_of_business} AS line_of_business \
             FROM {s} s LEFT JOIN {d} d ON d.{dkey} = s.{key} \
             WHERE s.{key} = {param}",
            friendly = q(&self.friendly_id_column),
            convr = q(&self.convr_id_column),
            param = db_type.placeholder(1),
        )
    }
}

/// Check `[A-Za-z_][A-Za-z0-9_]*`, optionally allowing dotted qualification.
pub fn validate_identifier(ident: &str, allow_qualified: bool) -> LookupResult<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let ok = if allow_qualified {
        ident.split('.').all(valid_part)
    } else {
        valid_part(ident)
    };

    if ok {
        Ok(())
    } else {
        Err(LookupError::configuration(format!(
            "'{}' is not a valid SQL identifier",
            ident
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("insured_json", false).is_ok());
        assert!(validate_identifier("_x1", false).is_ok());
        assert!(validate_identifier("uw.submissions", true).is_ok());

        assert!(validate_identifier("uw.submissions", false).is_err());
        assert!(validate_identifier("1col", false).is_err());
        assert!(validate_identifier("", false).is_err());
        assert!(validate_identifier("a; DROP TABLE x", false).is_err());
        assert!(validate_identifier("uw..x", true).is_err());
        assert!(validate_identifier("col\"", false).is_err());
    }

    #[test]
    fn test_default_schema_is_valid() {
        assert!(LookupSchema::default().validate().is_ok());
    }

    #[test]
    fn test_overview_template_binds_key_once() {
        let schema = LookupSchema::default();

        let pg = schema.overview_template(DatabaseType::Postgres);
        assert!(pg.contains("= $1"));
        assert!(!pg.contains("$2"));
        assert!(pg.contains("->>"));

        let sqlite = schema.overview_template(DatabaseType::SQLite);
        assert_eq!(sqlite.matches('?').count(), 1);
        assert!(sqlite.contains("json_extract"));

        let mysql = schema.overview_template(DatabaseType::MySql);
        assert!(mysql.contains("`submissions`"));
    }
}
