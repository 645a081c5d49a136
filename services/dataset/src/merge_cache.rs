use crate::join::JoinType;
use crate::table::Table;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Namespace for merge cache keys (UUIDv5)
const MERGE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_7267_6563_6163_6865_6b65_7973_0001);

/// The inputs that identify a merge result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub left_id: Uuid,
    pub right_id: Uuid,
    /// Normalised join column name
    pub join_column: String,
    pub join_type: JoinType,
}

impl MergeSpec {
    /// Deterministic cache key: identical merge requests map to the same entry
    pub fn cache_key(&self) -> String {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.left_id, self.right_id, self.join_column, self.join_type
        );
        Uuid::new_v5(&MERGE_KEY_NAMESPACE, name.as_bytes()).to_string()
    }
}

/// A cached merge result
#[derive(Debug)]
pub struct MergeEntry {
    pub key: String,
    pub spec: MergeSpec,
    pub table: Arc<Table>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Monotonic expiry used for all expiry decisions
    deadline: Instant,
}

impl MergeEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Time-limited store of merge results.
///
/// Owned by whoever builds the service and shared through an `Arc`. Entries
/// expire `ttl` after their last `put`. Expired entries are never returned;
/// they are removed lazily by `get` and in bulk by [`MergeCache::evict_expired`],
/// which the background sweeper calls periodically.
pub struct MergeCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Arc<MergeEntry>>>,
}

impl MergeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a merge result, replacing any entry under the same key and
    /// restarting its expiry
    pub fn put(&self, spec: MergeSpec, table: Table) -> Arc<MergeEntry> {
        let key = spec.cache_key();
        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::milliseconds(self.ttl.as_millis() as i64);

        let entry = Arc::new(MergeEntry {
            key: key.clone(),
            spec,
            table: Arc::new(table),
            created_at,
            expires_at,
            deadline: Instant::now() + self.ttl,
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, entry.clone());
        metrics::gauge!("merge_cache.entries").set(entries.len() as f64);

        entry
    }

    /// Look up a live entry. Expired entries count as misses and are removed.
    pub fn get(&self, key: &str) -> Option<Arc<MergeEntry>> {
        let now = Instant::now();

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    metrics::counter!("merge_cache.hits").increment(1);
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => {
                    metrics::counter!("merge_cache.misses").increment(1);
                    return None;
                }
            }
        }

        // Expired: remove it unless a concurrent put refreshed it meanwhile
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let live = match entries.get(key).map(|entry| entry.is_expired(now)) {
            Some(true) => {
                entries.remove(key);
                metrics::counter!("merge_cache.evicted").increment(1);
                None
            }
            Some(false) => entries.get(key).cloned(),
            None => None,
        };

        match live {
            Some(entry) => {
                metrics::counter!("merge_cache.hits").increment(1);
                Some(entry)
            }
            None => {
                metrics::counter!("merge_cache.misses").increment(1);
                None
            }
        }
    }

    /// Remove every expired entry, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - entries.len();

        if evicted > 0 {
            metrics::counter!("merge_cache.evicted").increment(evicted as u64);
        }
        metrics::gauge!("merge_cache.entries").set(entries.len() as f64);

        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`MergeCache::evict_expired`] every `interval` until `shutdown` is
    /// cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Merge cache sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, remaining = cache.len(), "Evicted expired merge results");
                        }
                    }
                }
            }

            info!("Merge cache sweeper stopped");
        })
    }
}
