//! Shared fixtures: a seeded SQLite submissions database.

#![allow(dead_code)]

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use submission_lookup::config::{AuthMode, Config};
use submission_lookup::lookup::SubmissionLookup;
use tempfile::TempDir;

pub const FRIENDLY_ID: &str = "SPARK-12345";
pub const CONVR_ID: &str = "CONVR-7F3A-0042";
pub const SUBMISSION_ID: i64 = 123;

/// Resolves but has no detail row.
pub const ORPHAN_FRIENDLY_ID: &str = "SPARK-20000";
pub const ORPHAN_ID: i64 = 200;

/// Shared by two submissions.
pub const DUPLICATE_FRIENDLY_ID: &str = "SPARK-DUP";

/// Has a 4 KiB underwriting section.
pub const LARGE_ID: i64 = 400;

const SCHEMA: &[&str] = &[
    "CREATE TABLE submissions (
        id INTEGER PRIMARY KEY,
        friendly_id TEXT NOT NULL,
        convr_id TEXT,
        status TEXT,
        created_at TEXT
    )",
    "CREATE TABLE submission_details (
        submission_id INTEGER PRIMARY KEY REFERENCES submissions(id),
        insured_json TEXT,
        coverages_json TEXT,
        loss_history_json TEXT,
        locations_json TEXT,
        exposures_json TEXT,
        underwriting_json TEXT,
        documents_json TEXT
    )",
];

/// A seeded database file that lives as long as this value.
pub struct Fixture {
    _dir: TempDir,
    pub url: String,
}

impl Fixture {
    pub fn config(&self) -> Config {
        Config {
            database_url: self.url.clone(),
            auth_mode: AuthMode::None,
            pool_max_size: 2,
            acquire_timeout_secs: 5,
            ..Config::default()
        }
    }

    pub fn lookup(&self) -> Arc<SubmissionLookup> {
        self.lookup_with(self.config())
    }

    pub fn lookup_with(&self, config: Config) -> Arc<SubmissionLookup> {
        Arc::new(SubmissionLookup::from_config(&config).unwrap())
    }
}

pub async fn seed_database() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("submissions.db");

    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();

    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }

    let submissions: &[(i64, &str, Option<&str>, &str)] = &[
        (SUBMISSION_ID, FRIENDLY_ID, Some(CONVR_ID), "quoted"),
        (ORPHAN_ID, ORPHAN_FRIENDLY_ID, None, "received"),
        (301, DUPLICATE_FRIENDLY_ID, None, "received"),
        (302, DUPLICATE_FRIENDLY_ID, None, "declined"),
        (LARGE_ID, "SPARK-40000", None, "bound"),
    ];
    for (id, friendly_id, convr_id, status) in submissions {
        sqlx::query(
            "INSERT INTO submissions (id, friendly_id, convr_id, status, created_at)
             VALUES (?, ?, ?, ?, '2024-03-01T10:00:00')",
        )
        .bind(id)
        .bind(friendly_id)
        .bind(convr_id)
        .bind(status)
        .execute(&mut conn)
        .await
        .unwrap();
    }

    sqlx::query(
        "INSERT INTO submission_details
            (submission_id, insured_json, coverages_json, loss_history_json, locations_json,
             exposures_json, underwriting_json, documents_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(SUBMISSION_ID)
    .bind(r#"{"name": "Acme Roofing LLC", "state": "TX", "fein": "12-3456789"}"#)
    .bind(r#"{"line_of_business": "General Liability", "limits": {"occurrence": 1000000}}"#)
    .bind(r#"[{"year": 2022, "claims": 1, "incurred": 15000.5}]"#)
    .bind(r#"[{"address": "1 Main St", "city": "Austin"}]"#)
    .bind("not structured")
    .bind(Option::<&str>::None)
    .bind("[]")
    .execute(&mut conn)
    .await
    .unwrap();

    let large = format!(r#"{{"notes": "{}"}}"#, "x".repeat(4096));
    sqlx::query(
        "INSERT INTO submission_details (submission_id, insured_json, underwriting_json)
         VALUES (?, ?, ?)",
    )
    .bind(LARGE_ID)
    .bind(r#"{"name": "Bigco"}"#)
    .bind(large)
    .execute(&mut conn)
    .await
    .unwrap();

    conn.close().await.unwrap();

    Fixture {
        url: format!("sqlite:{}", path.display()),
        _dir: dir,
    }
}
