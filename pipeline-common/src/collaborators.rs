//! Contracts of the systems the pipeline talks to, plus in-process implementations.
//!
//! Timeouts are the collaborator's business: the pipeline never wraps these calls in one of its
//! own, it only propagates whatever error comes back, `CollaboratorError::Timeout` included.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{self, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::{sync::Cache, Expiry};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::CollaboratorError;
use crate::event::ProcessedEvent;

/// Key/value cache used for enrichment context, real-time counters and, optionally, as a
/// deduplication store shared between instances. Failures are never fatal to the pipeline.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError>;
    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<time::Duration>,
    ) -> Result<(), CollaboratorError>;
    async fn exists(&self, key: &str) -> Result<bool, CollaboratorError>;
    async fn increment(&self, key: &str) -> Result<i64, CollaboratorError>;
}

/// Durable persistence of processed events. A failure here fails the pipeline run.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn persist(&self, record: &ProcessedEvent) -> Result<(), CollaboratorError>;
}

/// External rules engine, notified of every processed event. Failures are swallowed.
#[async_trait]
pub trait AutomationRules: Send + Sync {
    async fn evaluate(&self, event: &ProcessedEvent) -> Result<(), CollaboratorError>;
}

/// The set of collaborators an `EventPipeline` is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn CacheStore>,
    pub store: Arc<dyn DurableStore>,
    pub rules: Arc<dyn AutomationRules>,
}

impl Collaborators {
    /// Everything in process memory. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(MemoryCache::new()),
            store: Arc::new(MemoryStore::new()),
            rules: Arc::new(NoopRules {}),
        }
    }
}

/// Upper bound on the number of keys a `MemoryCache` holds before it starts evicting.
const DEFAULT_CACHE_CAPACITY: u64 = 100_000;

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn time_to_live(&self, now: DateTime<Utc>) -> Option<time::Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(time::Duration::ZERO))
    }
}

/// Evicts each entry once its own TTL has elapsed, as measured by the cache's clock when the
/// entry was written.
struct EntryExpiry {
    clock: Arc<dyn Clock>,
}

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<time::Duration> {
        entry.time_to_live(self.clock.now())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<time::Duration>,
    ) -> Option<time::Duration> {
        entry.time_to_live(self.clock.now())
    }
}

/// A `CacheStore` backed by a bounded `moka` cache with per-entry expiry. Entries that the
/// clock says are expired are invalidated as soon as they are read.
pub struct MemoryCache {
    entries: Cache<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY, clock)
    }

    pub fn with_capacity(max_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry {
                clock: clock.clone(),
            })
            .build();

        Self { entries, clock }
    }

    /// Number of entries currently held, after applying pending evictions.
    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_live(self.clock.now()) {
            Some(entry.value)
        } else {
            self.entries.invalidate(key);
            None
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self.live_value(key))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<time::Duration>,
    ) -> Result<(), CollaboratorError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                self.clock.now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| CollaboratorError::Rejected(e.to_string()))?,
            ),
            None => None,
        };
        self.entries
            .insert(key.to_owned(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CollaboratorError> {
        Ok(self.live_value(key).is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64, CollaboratorError> {
        let now = self.clock.now();
        let mut outcome = Ok(0);

        drop(
            self.entries
                .entry(key.to_owned())
                .and_upsert_with(|existing| {
                    let live = existing
                        .map(|entry| entry.into_value())
                        .filter(|entry| entry.is_live(now));
                    match live {
                        Some(entry) => match entry.value.parse::<i64>() {
                            Ok(current) => {
                                outcome = Ok(current + 1);
                                CacheEntry {
                                    value: (current + 1).to_string(),
                                    expires_at: entry.expires_at,
                                }
                            }
                            Err(_) => {
                                outcome = Err(CollaboratorError::Rejected(format!(
                                    "value at {key} is not an integer"
                                )));
                                entry
                            }
                        },
                        None => {
                            outcome = Ok(1);
                            CacheEntry {
                                value: "1".to_owned(),
                                expires_at: None,
                            }
                        }
                    }
                }),
        );

        outcome
    }
}

/// A `DurableStore` that logs and counts every record without retaining it. Stands in for a
/// real store when running the worker on its own.
pub struct LogStore {}

#[async_trait]
impl DurableStore for LogStore {
    async fn persist(&self, record: &ProcessedEvent) -> Result<(), CollaboratorError> {
        info!(
            processing_id = %record.processing_id,
            event_type = %record.event_type,
            session_id = %record.session_id,
            "persisted event"
        );
        metrics::counter!("pipeline_events_persisted_total").increment(1);

        Ok(())
    }
}

/// A `DurableStore` that keeps every persisted record in memory, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ProcessedEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProcessedEvent> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn persist(&self, record: &ProcessedEvent) -> Result<(), CollaboratorError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

pub struct NoopRules {}

#[async_trait]
impl AutomationRules for NoopRules {
    async fn evaluate(&self, event: &ProcessedEvent) -> Result<(), CollaboratorError> {
        debug!(
            processing_id = %event.processing_id,
            event_type = %event.event_type,
            "no automation rules configured"
        );
        Ok(())
    }
}
