//! Submission lookup: identifier resolution, section allowlist and guarded dispatch.

pub mod dispatcher;
pub mod identifier;
pub mod schema;
pub mod sections;
pub mod service;

pub use dispatcher::{Guardrails, QueryDispatcher};
pub use identifier::{IdentifierKind, IdentifierResolver, SubmissionIdentifier};
pub use schema::LookupSchema;
pub use sections::{OVERVIEW_SECTION, SectionCatalog, SectionRequest};
pub use service::{
    LookupFailure, LookupOutcome, LookupRequest, LookupResponse, QueryMetrics, SectionsInfo,
    SubmissionLookup,
};
