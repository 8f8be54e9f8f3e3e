//! Explicit expiring cache for slow-changing upstream data.
//!
//! The cache owns its TTL and clock and is handed to the collaborator that uses
//! it, so tests can drive expiry with a [`ManualClock`].

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fscr_core::MediaRecord;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{AdapterError, MediaCatalog};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

struct Entry<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

pub struct ExpiringCache<T> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<Entry<T>>>,
}

impl<T: Clone> ExpiringCache<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Option<T> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|entry| self.clock.now() < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    pub async fn put(&self, value: T) {
        let expires_at = self.clock.now() + self.ttl;
        *self.slot.lock().await = Some(Entry { value, expires_at });
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Returns the live value or loads a fresh one. Load errors are not cached.
    pub async fn get_or_try_load<F, Fut, E>(&self, load: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        if let Some(entry) = slot.as_ref().filter(|entry| now < entry.expires_at) {
            return Ok(entry.value.clone());
        }
        let value = load().await?;
        *slot = Some(Entry {
            value: value.clone(),
            expires_at: now + self.ttl,
        });
        Ok(value)
    }
}

/// Serves the wrapped catalog from an [`ExpiringCache`] until it expires.
pub struct CachedMediaCatalog<C> {
    inner: C,
    cache: Arc<ExpiringCache<Vec<MediaRecord>>>,
}

impl<C: MediaCatalog> CachedMediaCatalog<C> {
    pub fn new(inner: C, cache: Arc<ExpiringCache<Vec<MediaRecord>>>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<C: MediaCatalog> MediaCatalog for CachedMediaCatalog<C> {
    fn catalog_id(&self) -> &str {
        self.inner.catalog_id()
    }

    async fn fetch_catalog(&self) -> Result<Vec<MediaRecord>, AdapterError> {
        self.cache
            .get_or_try_load(|| async {
                let catalog_id = self.inner.catalog_id();
                debug!(catalog_id, "media catalog cache miss");
                self.inner.fetch_catalog().await
            })
            .await
    }
}
