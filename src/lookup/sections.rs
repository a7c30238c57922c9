//! Section allowlist.
//!
//! A [`SectionCatalog`] is the only authority on what a lookup may fetch: each
//! section name maps to exactly one column of the details table, plus the
//! special `overview` section served by a fixed template. Callers name
//! sections; they never name columns.

use crate::config::SectionOverride;
use crate::error::{LookupError, LookupResult};
use crate::lookup::schema::validate_identifier;
use std::collections::BTreeMap;

/// Section returned when a request names none.
pub const OVERVIEW_SECTION: &str = "overview";

const DEFAULT_SECTIONS: &[(&str, &str)] = &[
    ("coverages", "coverages_json"),
    ("documents", "documents_json"),
    ("exposures", "exposures_json"),
    ("insured", "insured_json"),
    ("locations", "locations_json"),
    ("loss_history", "loss_history_json"),
    ("underwriting", "underwriting_json"),
];

/// Immutable mapping of section name to details column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionCatalog {
    columns: BTreeMap<String, String>,
}

impl SectionCatalog {
    /// Build and validate a catalog.
    pub fn new<I, N, C>(mapping: I) -> LookupResult<Self>
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        let mut columns = BTreeMap::new();
        for (name, column) in mapping {
            let (name, column) = (name.into(), column.into());
            if name == OVERVIEW_SECTION {
                return Err(LookupError::configuration(
                    "'overview' is served by the overview template and cannot be mapped to a column",
                ));
            }
            validate_identifier(&name, false)?;
            validate_identifier(&column, false)?;
            if columns.insert(name.clone(), column).is_some() {
                return Err(LookupError::configuration(format!(
                    "Section '{}' is mapped more than once",
                    name
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Built-in mapping.
    pub fn default_catalog() -> Self {
        Self {
            columns: DEFAULT_SECTIONS
                .iter()
                .map(|(name, column)| (name.to_string(), column.to_string()))
                .collect(),
        }
    }

    /// Catalog from configured overrides, or the built-in mapping if there are none.
    pub fn from_overrides(overrides: &[SectionOverride]) -> LookupResult<Self> {
        if overrides.is_empty() {
            return Ok(Self::default_catalog());
        }
        Self::new(
            overrides
                .iter()
                .map(|o| (o.name.clone(), o.column.clone())),
        )
    }

    /// Column backing `section`. `None` for `overview` and unknown names.
    pub fn column(&self, section: &str) -> Option<&str> {
        self.columns.get(section).map(String::as_str)
    }

    /// Every allowed section name, sorted, including `overview`.
    pub fn allowed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.keys().cloned().collect();
        names.push(OVERVIEW_SECTION.to_string());
        names.sort();
        names
    }

    /// Distinct mapped columns, sorted.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.columns.values().map(String::as_str).collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    fn is_allowed(&self, section: &str) -> bool {
        section == OVERVIEW_SECTION || self.columns.contains_key(section)
    }

    /// Validate a caller's section list.
    ///
    /// Names must match exactly: case and surrounding whitespace both count.
    /// They are deduplicated in first-seen order, and the count limit is
    /// checked before the names.
    pub fn validate(
        &self,
        requested: Option<&[String]>,
        max_sections: usize,
    ) -> LookupResult<SectionRequest> {
        let mut names: Vec<String> = Vec::new();
        for name in requested.unwrap_or_default() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        if names.is_empty() {
            names.push(OVERVIEW_SECTION.to_string());
        }

        if names.len() > max_sections {
            return Err(LookupError::TooManySections {
                requested: names.len(),
                max: max_sections,
            });
        }

        let invalid: Vec<String> = names
            .iter()
            .filter(|name| !self.is_allowed(name))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(LookupError::InvalidSections {
                invalid,
                allowed: self.allowed_names(),
            });
        }

        Ok(SectionRequest { names })
    }
}

/// A validated, deduplicated list of section names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRequest {
    names: Vec<String>,
}

impl SectionRequest {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn includes_overview(&self) -> bool {
        self.names.iter().any(|n| n == OVERVIEW_SECTION)
    }

    /// Requested sections other than `overview`.
    pub fn column_sections(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .map(String::as_str)
            .filter(|n| *n != OVERVIEW_SECTION)
    }
}
