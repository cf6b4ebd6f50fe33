use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use chrono::{DateTime, Duration, Utc};
use siphasher::sip::SipHasher13;
use tracing::warn;

use crate::clock::Clock;
use crate::collaborators::CacheStore;
use crate::event::ValidatedEvent;

/// Content hash of an event over its type, user, session and data payload.
///
/// Uses a fixed-key SipHash so that two instances sharing a cache compute the same key for
/// the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeduplicationKey(u64);

impl DeduplicationKey {
    pub fn for_event(event: &ValidatedEvent) -> Self {
        // serde_json::Map is ordered by key, so equal payloads serialize identically.
        let data = serde_json::to_string(&event.data).unwrap_or_default();

        let mut hasher = SipHasher13::new();
        (
            event.event_type.as_str(),
            event.user_id.as_deref(),
            event.session_id.as_str(),
            data.as_str(),
        )
            .hash(&mut hasher);
        DeduplicationKey(hasher.finish())
    }
}

impl fmt::Display for DeduplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Time-windowed membership set of recently seen events.
///
/// Expired entries are not removed on access: `sweep` does that on the cleanup tick. Lookups
/// still compare against the window, so an entry the sweep has not reached yet is not mistaken
/// for a fresh duplicate.
pub struct DeduplicationCache {
    window: Duration,
    ttl: time::Duration,
    seen: Mutex<HashMap<DeduplicationKey, DateTime<Utc>>>,
    shared: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
}

impl DeduplicationCache {
    pub fn new(window: time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::days(1)),
            ttl: window,
            seen: Mutex::new(HashMap::new()),
            shared: None,
            clock,
        }
    }

    /// Consult `store` before the local map, so duplicates are caught across every instance
    /// sharing that store.
    pub fn with_shared_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.shared = Some(store);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeduplicationKey, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if `key` was recorded less than a window ago. Otherwise records it and
    /// returns false. Seeing a key again does not extend its window.
    pub async fn seen(&self, key: DeduplicationKey) -> bool {
        let now = self.clock.now();

        if let Some(shared) = &self.shared {
            let shared_key = format!("dedup:{key}");
            match shared.exists(&shared_key).await {
                Ok(true) => return true,
                Ok(false) => {
                    let value = now.timestamp_millis().to_string();
                    if let Err(error) = shared.set(&shared_key, value, Some(self.ttl)).await {
                        warn!(key = %key, "failed to record key in shared dedup store: {}", error);
                    }
                }
                Err(error) => {
                    warn!(key = %key, "shared dedup store unavailable, using local map: {}", error);
                }
            }
        }

        let mut seen = self.lock();
        match seen.get(&key) {
            Some(at) if now < *at + self.window => true,
            _ => {
                _ = seen.insert(key, now);
                false
            }
        }
    }

    /// Drop every entry older than the window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.window;
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, at| now < *at + window);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::MemoryCache;
    use crate::event::Priority;
    use serde_json::{json, Map, Value};

    fn event(event_type: &str, user_id: Option<&str>, data: Value) -> ValidatedEvent {
        let now = Utc::now();
        let data: Map<String, Value> = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ValidatedEvent {
            processing_id: crate::validation::generate_processing_id(),
            event_type: event_type.to_owned(),
            timestamp: now,
            session_id: "s1".to_owned(),
            user_id: user_id.map(str::to_owned),
            data,
            priority: Priority::Low,
            validated_at: now,
        }
    }

    #[test]
    fn test_key_ignores_processing_id_and_field_order() {
        let a = event("page_view", Some("u1"), json!({"url": "/a", "ref": "x"}));
        let b = event("page_view", Some("u1"), json!({"ref": "x", "url": "/a"}));
        assert_ne!(a.processing_id, b.processing_id);
        assert_eq!(DeduplicationKey::for_event(&a), DeduplicationKey::for_event(&b));
    }

    #[test]
    fn test_key_depends_on_content() {
        let base = event("page_view", Some("u1"), json!({"url": "/a"}));
        let other_type = event("click", Some("u1"), json!({"url": "/a"}));
        let other_user = event("page_view", None, json!({"url": "/a"}));
        let other_data = event("page_view", Some("u1"), json!({"url": "/b"}));

        let key = DeduplicationKey::for_event(&base);
        assert_ne!(key, DeduplicationKey::for_event(&other_type));
        assert_ne!(key, DeduplicationKey::for_event(&other_user));
        assert_ne!(key, DeduplicationKey::for_event(&other_data));
        assert_eq!(key.to_string().len(), 16);
    }

    #[tokio::test]
    async fn test_seen_within_window() {
        let clock = ManualClock::default();
        let cache = DeduplicationCache::new(time::Duration::from_secs(5), Arc::new(clock.clone()));
        let key = DeduplicationKey::for_event(&event("page_view", None, json!({})));

        assert!(!cache.seen(key).await);
        clock.advance(time::Duration::from_secs(4));
        assert!(cache.seen(key).await);

        // The second sighting did not refresh the window.
        clock.advance(time::Duration::from_secs(2));
        assert!(!cache.seen(key).await);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let clock = ManualClock::default();
        let cache = DeduplicationCache::new(time::Duration::from_secs(5), Arc::new(clock.clone()));

        let old = DeduplicationKey::for_event(&event("page_view", None, json!({"n": 1})));
        assert!(!cache.seen(old).await);
        clock.advance(time::Duration::from_secs(3));
        let fresh = DeduplicationKey::for_event(&event("page_view", None, json!({"n": 2})));
        assert!(!cache.seen(fresh).await);
        assert_eq!(cache.len(), 2);

        clock.advance(time::Duration::from_secs(3));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.seen(fresh).await);
    }

    #[tokio::test]
    async fn test_shared_store_spans_instances() {
        let clock = ManualClock::default();
        let shared = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
        let first = DeduplicationCache::new(time::Duration::from_secs(5), Arc::new(clock.clone()))
            .with_shared_store(shared.clone());
        let second = DeduplicationCache::new(time::Duration::from_secs(5), Arc::new(clock.clone()))
            .with_shared_store(shared.clone());
        let key = DeduplicationKey::for_event(&event("booking_complete", Some("u1"), json!({})));

        assert!(!first.seen(key).await);
        assert!(second.seen(key).await);
        assert!(second.is_empty());

        clock.advance(time::Duration::from_secs(6));
        assert!(!second.seen(key).await);
    }
}
