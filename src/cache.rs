use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub data: V,
    pub timestamp: i64,
}

struct CacheInner<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl<V> CacheInner<V> {
    fn is_expired(&self, entry: &CacheEntry<V>, now: i64) -> bool {
        now - entry.timestamp > self.ttl_ms
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.timestamp <= self.ttl_ms);
        before - entries.len()
    }
}

/// TTL cache for search results.
///
/// Reads re-check the entry age, so an expired entry is a miss even if the
/// background sweep has not run yet.
pub struct PlacesCache<V> {
    inner: Arc<CacheInner<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + Sync + 'static> PlacesCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                ttl_ms: ttl.as_millis() as i64,
                clock,
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(SystemClock))
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now_ms();
        let entries = self.inner.entries.lock();
        let entry = entries.get(key)?;
        if self.inner.is_expired(entry, now) {
            return None;
        }
        Some(entry.data.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            data: value,
            timestamp: self.inner.clock.now_ms(),
        };
        self.inner.entries.lock().insert(key, entry);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.entries.lock().remove(key).map(|entry| entry.data)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Drops every expired entry and returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    /// Starts the periodic sweep. Needs a tokio runtime; without one the
    /// cache still works and relies on read-time expiry alone.
    pub fn start_cleanup_timer(&self, interval: Duration) {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    target: "places_cache",
                    "no async runtime available; cache sweep disabled"
                );
                return;
            }
        };

        let weak: Weak<CacheInner<V>> = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = inner.sweep();
                if evicted > 0 {
                    debug!(target: "places_cache", evicted, "evicted expired cache entries");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn stop_cleanup_timer(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl<V> Drop for PlacesCache<V> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_cache(ttl_secs: u64) -> (PlacesCache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = PlacesCache::new(Duration::from_secs(ttl_secs), clock.clone());
        (cache, clock)
    }

    #[test]
    fn returns_value_right_after_set() {
        let (cache, _) = manual_cache(60);
        cache.set("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn expires_after_ttl_without_sweep() {
        let (cache, clock) = manual_cache(60);
        cache.set("k", "v".to_string());
        clock.advance(Duration::from_secs(60));
        assert!(cache.get("k").is_some());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let (cache, clock) = manual_cache(10);
        cache.set("old", "a".to_string());
        clock.advance(Duration::from_secs(8));
        cache.set("fresh", "b".to_string());
        clock.advance(Duration::from_secs(5));

        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.get("old").is_none());
        assert_eq!(cache.get("fresh").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_timer_sweeps_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: PlacesCache<String> = PlacesCache::new(Duration::from_secs(1), clock.clone());
        cache.set("k", "v".to_string());
        cache.start_cleanup_timer(Duration::from_secs(30));
        assert!(cache.is_cleanup_running());

        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(cache.is_empty());

        cache.stop_cleanup_timer();
        assert!(!cache.is_cleanup_running());
    }

    #[test]
    fn timer_is_noop_without_runtime() {
        let (cache, _) = manual_cache(1);
        cache.start_cleanup_timer(Duration::from_secs(1));
        assert!(!cache.is_cleanup_running());
    }
}
