//! Core domain model for the food stall catalog reconciler (FSCR).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;

pub const CRATE_NAME: &str = "fscr-core";

/// Source key -> payload hash for every currently-active stall. Used only for diffing.
pub type ActiveIndex = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One raw row from one upstream feed. Ephemeral per run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable per-row identity key assigned by the feed.
    pub row_key: String,
    #[serde(default)]
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub cuisine: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub episode_number: Option<u32>,
    #[serde(default)]
    pub dish_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub host_rating: Option<f64>,
    #[serde(default)]
    pub guest_rating: Option<f64>,
    #[serde(default)]
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub hits: Vec<String>,
    #[serde(default)]
    pub misses: Vec<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default)]
    pub media_title: Option<String>,
    #[serde(default)]
    pub awards: Vec<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

/// Entry of the external video catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallStatus {
    #[default]
    Active,
    Closed,
}

impl StallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub stall_id: String,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub media_url: Option<String>,
    pub is_primary: bool,
    pub is_active: bool,
}

/// The single reconciled record for one real-world stall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalStall {
    pub id: String,
    pub source_key: String,
    pub slug: String,
    pub name: String,
    pub cuisine_id: String,
    pub cuisine_label: String,
    pub country: String,
    pub primary_address: String,
    pub episode_number: Option<u32>,
    pub dish_name: Option<String>,
    pub price: Option<f64>,
    pub host_rating: Option<f64>,
    pub guest_rating: Option<f64>,
    pub opening_hours: Option<String>,
    pub time_categories: Vec<String>,
    pub hits: Vec<String>,
    pub misses: Vec<String>,
    pub media_title: Option<String>,
    pub media_url: Option<String>,
    pub media_id: Option<String>,
    pub awards: Vec<String>,
    pub status: StallStatus,
    pub rank_score: f64,
    /// Hash over contributing raw-row identity keys. Debugging only.
    pub inputs_hash: String,
    /// Hash over the resolved media id. Debugging only.
    pub media_hash: String,
    pub payload_hash: String,
    pub locations: Vec<Location>,
    pub last_synced_at: DateTime<Utc>,
}

impl CanonicalStall {
    pub fn primary_location(&self) -> Option<&Location> {
        self.locations.iter().find(|l| l.is_primary && l.is_active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    DryRun,
    Apply,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Apply => "apply",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dry-run" | "dryrun" | "dry_run" => Some(Self::DryRun),
            "apply" => Some(Self::Apply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    #[default]
    Manual,
    Scheduled,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Guarded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Guarded => "guarded",
            Self::Failed => "failed",
        }
    }
}

/// Structured outcome of one run. Suitable for logging, alerting or a status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: SyncTrigger,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_active: usize,
    pub fresh_total: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub closed: usize,
    pub closure_ratio: f64,
    pub guardrail_tripped: bool,
    pub forced: bool,
    pub seeded: bool,
    pub slug_adjustments: usize,
    pub closed_keys: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Append-only audit row, one per run regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
    pub error: Option<String>,
}

impl SyncRun {
    pub fn from_summary(summary: &RunSummary) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: summary.run_id,
            trigger: summary.trigger,
            mode: summary.mode,
            status: summary.status,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            summary: serde_json::to_string(summary)?,
            error: summary.error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_record_defaults_optional_fields() {
        let json = r#"{
            "row_key": "r1",
            "name": "Ah Seng",
            "address": "1 Market St",
            "cuisine": "Satay",
            "country": "sg"
        }"#;
        let record: SourceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.row_key, "r1");
        assert!(record.hits.is_empty());
        assert!(record.media_ref.is_none());
        assert!(record.coordinates.is_none());
    }

    #[test]
    fn mode_parsing_accepts_common_spellings() {
        assert_eq!(SyncMode::parse("apply"), Some(SyncMode::Apply));
        assert_eq!(SyncMode::parse(" Dry-Run "), Some(SyncMode::DryRun));
        assert_eq!(SyncMode::parse("dry_run"), Some(SyncMode::DryRun));
        assert_eq!(SyncMode::parse("commit"), None);
        assert_eq!(
            serde_json::to_string(&SyncMode::DryRun).unwrap(),
            "\"dry-run\""
        );
    }
}
