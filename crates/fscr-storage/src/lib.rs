//! Catalog persistence contract plus in-memory and Postgres implementations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fscr_core::{ActiveIndex, CanonicalStall, StallStatus, SyncRun};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

mod postgres;

pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "fscr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Everything one run writes. Applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    /// New and updated stalls, each with its full reconfirmed location set.
    pub upserts: Vec<CanonicalStall>,
    /// Source keys of previously-active stalls to flip to closed.
    pub closures: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.closures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub stalls_written: usize,
    pub locations_written: usize,
    pub locations_deactivated: usize,
    pub stalls_closed: usize,
}

/// Store operations the sync engine needs. Implementations must make `commit` atomic.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Single-pass read of source key -> payload hash over active stalls.
    async fn load_active_index(&self) -> Result<ActiveIndex, StoreError>;

    /// Source key -> slug for active stalls and stalls closed at or after `closed_since`.
    async fn load_slug_index(
        &self,
        closed_since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, StoreError>;

    async fn fetch_stall(&self, source_key: &str) -> Result<Option<CanonicalStall>, StoreError>;

    async fn commit(&self, plan: &CommitPlan) -> Result<CommitOutcome, StoreError>;

    /// Append-only audit write.
    async fn record_run(&self, run: &SyncRun) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    stalls: BTreeMap<String, CanonicalStall>,
    runs: Vec<SyncRun>,
    commits: usize,
}

/// Process-local store used by tests and dry runs without a database.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_audit: AtomicBool,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stalls(stalls: impl IntoIterator<Item = CanonicalStall>) -> Self {
        let state = MemoryState {
            stalls: stalls
                .into_iter()
                .map(|s| (s.source_key.clone(), s))
                .collect(),
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// The next commit fails after staging its upserts; nothing becomes visible.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn set_fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    pub async fn stalls(&self) -> Vec<CanonicalStall> {
        self.state.lock().await.stalls.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.clone()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commits
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store reads disabled".into()));
        }
        Ok(())
    }
}

fn merge_upsert(
    existing: Option<&CanonicalStall>,
    incoming: &CanonicalStall,
) -> (CanonicalStall, usize) {
    let mut merged = incoming.clone();
    let mut deactivated = 0usize;
    if let Some(previous) = existing {
        for old in &previous.locations {
            if merged.locations.iter().any(|l| l.id == old.id) {
                continue;
            }
            let mut retired = old.clone();
            if retired.is_active {
                deactivated += 1;
            }
            retired.is_active = false;
            retired.is_primary = false;
            merged.locations.push(retired);
        }
    }
    (merged, deactivated)
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load_active_index(&self) -> Result<ActiveIndex, StoreError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state
            .stalls
            .values()
            .filter(|s| s.status == StallStatus::Active)
            .map(|s| (s.source_key.clone(), s.payload_hash.clone()))
            .collect())
    }

    async fn load_slug_index(
        &self,
        closed_since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state
            .stalls
            .values()
            .filter(|s| s.status == StallStatus::Active || s.last_synced_at >= closed_since)
            .map(|s| (s.source_key.clone(), s.slug.clone()))
            .collect())
    }

    async fn fetch_stall(&self, source_key: &str) -> Result<Option<CanonicalStall>, StoreError> {
        self.check_reads()?;
        Ok(self.state.lock().await.stalls.get(source_key).cloned())
    }

    async fn commit(&self, plan: &CommitPlan) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = state.stalls.clone();
        let mut outcome = CommitOutcome::default();

        for stall in &plan.upserts {
            let (merged, deactivated) = merge_upsert(staged.get(&stall.source_key), stall);
            outcome.stalls_written += 1;
            outcome.locations_written += stall.locations.len();
            outcome.locations_deactivated += deactivated;
            staged.insert(stall.source_key.clone(), merged);
        }

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store commit failed after staging upserts".into(),
            ));
        }

        for key in &plan.closures {
            let Some(stall) = staged.get_mut(key) else {
                continue;
            };
            stall.status = StallStatus::Closed;
            stall.last_synced_at = plan.synced_at;
            for location in &mut stall.locations {
                if location.is_active {
                    outcome.locations_deactivated += 1;
                }
                location.is_active = false;
            }
            outcome.stalls_closed += 1;
        }

        state.stalls = staged;
        state.commits += 1;
        debug!(
            stalls_written = outcome.stalls_written,
            stalls_closed = outcome.stalls_closed,
            "memory store commit applied"
        );
        Ok(outcome)
    }

    async fn record_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit table unavailable".into()));
        }
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fscr_core::Location;

    fn stall(key: &str, hash: &str, addresses: &[&str]) -> CanonicalStall {
        let id = format!("stall_{key}");
        CanonicalStall {
            id: id.clone(),
            source_key: key.to_string(),
            slug: key.to_string(),
            name: key.to_string(),
            cuisine_id: "satay".into(),
            cuisine_label: "Satay".into(),
            country: "SG".into(),
            primary_address: addresses.first().copied().unwrap_or_default().to_string(),
            episode_number: None,
            dish_name: None,
            price: None,
            host_rating: None,
            guest_rating: None,
            opening_hours: None,
            time_categories: vec![],
            hits: vec![],
            misses: vec![],
            media_title: None,
            media_url: None,
            media_id: None,
            awards: vec![],
            status: StallStatus::Active,
            rank_score: 0.0,
            inputs_hash: String::new(),
            media_hash: String::new(),
            payload_hash: hash.to_string(),
            locations: addresses
                .iter()
                .enumerate()
                .map(|(i, a)| Location {
                    id: format!("loc_{key}_{a}"),
                    stall_id: id.clone(),
                    address: a.to_string(),
                    coordinates: None,
                    media_url: None,
                    is_primary: i == 0,
                    is_active: true,
                })
                .collect(),
            last_synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failed_commit_leaves_store_untouched() {
        let store = MemoryCatalogStore::with_stalls([stall("a", "h1", &["1 Road"])]);
        store.fail_next_commit();
        let plan = CommitPlan {
            upserts: vec![stall("a", "h2", &["2 Road"]), stall("b", "h3", &["3 Road"])],
            closures: vec![],
            synced_at: Utc::now(),
        };
        assert!(store.commit(&plan).await.is_err());

        let index = store.load_active_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index["a"], "h1");
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn upsert_deactivates_unconfirmed_locations() {
        let store = MemoryCatalogStore::with_stalls([stall("a", "h1", &["1 Road", "2 Road"])]);
        let plan = CommitPlan {
            upserts: vec![stall("a", "h2", &["2 Road"])],
            closures: vec![],
            synced_at: Utc::now(),
        };
        let outcome = store.commit(&plan).await.unwrap();
        assert_eq!(outcome.locations_deactivated, 1);

        let saved = store.fetch_stall("a").await.unwrap().unwrap();
        let active: Vec<_> = saved.locations.iter().filter(|l| l.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "2 Road");
        assert_eq!(saved.locations.iter().filter(|l| l.is_primary).count(), 1);
    }

    #[tokio::test]
    async fn closure_flips_status_and_keeps_history() {
        let store = MemoryCatalogStore::with_stalls([stall("a", "h1", &["1 Road"])]);
        let plan = CommitPlan {
            upserts: vec![],
            closures: vec!["a".into()],
            synced_at: Utc::now(),
        };
        store.commit(&plan).await.unwrap();

        assert!(store.load_active_index().await.unwrap().is_empty());
        let closed = store.fetch_stall("a").await.unwrap().unwrap();
        assert_eq!(closed.status, StallStatus::Closed);
        assert!(closed.locations.iter().all(|l| !l.is_active));

        let recent = store
            .load_slug_index(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(recent.get("a").map(String::as_str), Some("a"));
        let stale = store
            .load_slug_index(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(stale.is_empty());
    }
}
