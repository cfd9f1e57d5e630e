//! Core domain model for the friendly-title sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ftsync-core";

/// One product record as returned by the catalog list endpoint.
///
/// Read-only to the pipeline; fetched once per run and never cached across
/// runs. `current_value` is the stored derived-field value resolved by the
/// configured namespace+key during listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    pub description_html: String,
    pub current_value: Option<String>,
}

/// Which slice of the description becomes the friendly title. Selected
/// once at configuration time and applied uniformly for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionPolicy {
    FirstParagraph,
    FirstLine,
    #[default]
    FirstSentence,
}

#[derive(Debug, Error)]
#[error("unknown extraction policy `{0}` (expected first-paragraph, first-line or first-sentence)")]
pub struct ParsePolicyError(String);

impl std::str::FromStr for ExtractionPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-paragraph" => Ok(Self::FirstParagraph),
            "first-line" => Ok(Self::FirstLine),
            "first-sentence" => Ok(Self::FirstSentence),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// Per-run counters, emitted once at run end. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Decides whether a freshly derived value needs to be written back.
///
/// Empty candidates are never written; equality is trim-insensitive; a
/// missing stored value always differs from a non-empty candidate.
pub fn should_write(current: Option<&str>, candidate: &str) -> bool {
    if candidate.trim().is_empty() {
        return false;
    }
    match current {
        Some(existing) => existing.trim() != candidate.trim(),
        None => true,
    }
}
