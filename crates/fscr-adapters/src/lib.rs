//! Collaborator contracts for the reconciler inputs, plus JSON-file implementations.
//!
//! Raw feed fetching and parsing happen upstream; sources here hand over typed
//! [`SourceRecord`]s and [`MediaRecord`]s.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fscr_core::{Coordinates, MediaRecord, SourceRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod cache;

pub use cache::{CachedMediaCatalog, Clock, ExpiringCache, ManualClock, SystemClock};

pub const CRATE_NAME: &str = "fscr-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// A feed of raw stall rows (the spreadsheet-style source).
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, AdapterError>;
}

/// The video catalog used for media association.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    fn catalog_id(&self) -> &str;

    async fn fetch_catalog(&self) -> Result<Vec<MediaRecord>, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBundle {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<SourceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaBundle {
    pub catalog_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<MediaRecord>,
}

/// Fallback stall in canonical shape; ids and hashes are derived downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedStall {
    pub name: String,
    pub cuisine: String,
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
    pub media_id: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_title: Option<String>,
    #[serde(default)]
    pub awards: Vec<String>,
    pub locations: Vec<SeedLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedLocation {
    pub address: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeedBundle {
    #[allow(dead_code)]
    version: u32,
    stalls: Vec<SeedStall>,
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, AdapterError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AdapterError::Io {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_str(&data).map_err(|source| AdapterError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub async fn load_record_bundle(path: impl AsRef<Path>) -> Result<RecordBundle, AdapterError> {
    read_json_file(path.as_ref()).await
}

pub async fn load_media_bundle(path: impl AsRef<Path>) -> Result<MediaBundle, AdapterError> {
    read_json_file(path.as_ref()).await
}

pub async fn load_static_seed(path: impl AsRef<Path>) -> Result<Vec<SeedStall>, AdapterError> {
    let bundle: SeedBundle = read_json_file(path.as_ref()).await?;
    Ok(bundle.stalls)
}

/// Reads an already-typed record bundle from disk.
#[derive(Debug, Clone)]
pub struct JsonFileRecordSource {
    source_id: String,
    path: PathBuf,
}

impl JsonFileRecordSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl RecordSource for JsonFileRecordSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, AdapterError> {
        let bundle = load_record_bundle(&self.path).await?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "bundle source_id={} does not match source_id={}",
                bundle.source_id, self.source_id
            )));
        }
        debug!(source_id = %self.source_id, records = bundle.records.len(), "loaded record bundle");
        Ok(bundle
            .records
            .into_iter()
            .map(|mut record| {
                if record.source_id.is_empty() {
                    record.source_id = self.source_id.clone();
                }
                record
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileMediaCatalog {
    catalog_id: String,
    path: PathBuf,
}

impl JsonFileMediaCatalog {
    pub fn new(catalog_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl MediaCatalog for JsonFileMediaCatalog {
    fn catalog_id(&self) -> &str {
        &self.catalog_id
    }

    async fn fetch_catalog(&self) -> Result<Vec<MediaRecord>, AdapterError> {
        let bundle = load_media_bundle(&self.path).await?;
        if bundle.catalog_id != self.catalog_id {
            return Err(AdapterError::Message(format!(
                "bundle catalog_id={} does not match catalog_id={}",
                bundle.catalog_id, self.catalog_id
            )));
        }
        Ok(bundle.items)
    }
}

/// In-memory feed; `unavailable` simulates an upstream outage.
#[derive(Debug, Clone, Default)]
pub struct StaticRecordSource {
    source_id: String,
    records: Vec<SourceRecord>,
    outage: Option<String>,
}

impl StaticRecordSource {
    pub fn new(source_id: impl Into<String>, records: Vec<SourceRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
            outage: None,
        }
    }

    pub fn unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            records: Vec::new(),
            outage: Some(reason.into()),
        }
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_records(&self) -> Result<Vec<SourceRecord>, AdapterError> {
        if let Some(reason) = &self.outage {
            return Err(AdapterError::Message(reason.clone()));
        }
        Ok(self.records.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticMediaCatalog {
    items: Vec<MediaRecord>,
    outage: Option<String>,
}

impl StaticMediaCatalog {
    pub fn new(items: Vec<MediaRecord>) -> Self {
        Self {
            items,
            outage: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            outage: Some(reason.into()),
        }
    }
}

#[async_trait]
impl MediaCatalog for StaticMediaCatalog {
    fn catalog_id(&self) -> &str {
        "static"
    }

    async fn fetch_catalog(&self) -> Result<Vec<MediaRecord>, AdapterError> {
        if let Some(reason) = &self.outage {
            return Err(AdapterError::Message(reason.clone()));
        }
        Ok(self.items.clone())
    }
}
