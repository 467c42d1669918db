//! Layered cache - exact tier, semantic tier, optional durable tier
//!
//! Lookups try the exact key first, then the closest embedding in the same
//! scope above the similarity threshold, then (when a store is attached and
//! write-through is on) the durable store. Populations are single-flight per
//! key. Settings are read from the live config on every call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheHit, PersistedEntry, Provenance, ScopedEmbedding};
use super::semantic::best_match;
use crate::config::{CacheConfig, ConfigHandle};
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;
use crate::storage::KeyValueStore;

/// Key prefix for persisted entries
pub const CACHE_PREFIX: &str = "cache/";

type PopulationCell = Arc<OnceCell<std::result::Result<Value, String>>>;

/// How a `get_or_populate` call was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from a cache tier
    Hit(Provenance),
    /// This caller ran the population
    Populated,
    /// Another caller's in-flight population answered
    Coalesced,
}

/// Result of `get_or_populate`
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub value: Value,
    pub source: CacheSource,
}

/// Point-in-time cache occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub with_embeddings: usize,
    pub in_flight: usize,
}

/// Exact + semantic cache with TTL, LRU eviction and stampede protection
pub struct LayeredCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    in_flight: DashMap<String, PopulationCell>,
    config: ConfigHandle,
    store: Option<Arc<dyn KeyValueStore>>,
    metrics: Arc<MetricsRegistry>,
}

impl LayeredCache {
    pub fn new(config: ConfigHandle, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            config,
            store: None,
            metrics,
        }
    }

    /// Attach a durable tier (used when `write_through` is enabled)
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current cache settings
    pub fn settings(&self) -> CacheConfig {
        self.config.snapshot().cache.clone()
    }

    fn durable(&self) -> Option<&Arc<dyn KeyValueStore>> {
        if self.config.snapshot().cache.write_through {
            self.store.as_ref()
        } else {
            None
        }
    }

    /// Look up an exact key, falling back to semantic similarity within the
    /// embedding's scope
    ///
    /// Store failures degrade to a miss.
    pub async fn lookup(&self, key: &str, embedding: Option<&ScopedEmbedding>) -> Option<CacheHit> {
        let now = Instant::now();

        if let Some(hit) = self.exact(key, now) {
            self.metrics.record_cache_hit(Provenance::Exact);
            return Some(hit);
        }

        if let Some(query) = embedding {
            if let Some(hit) = self.semantic(query, now) {
                self.metrics.record_cache_hit(Provenance::Semantic);
                return Some(hit);
            }
        }

        if let Some(hit) = self.probe_store(key).await {
            self.metrics.record_cache_hit(Provenance::Exact);
            return Some(hit);
        }

        self.metrics.record_cache_miss();
        None
    }

    fn exact(&self, key: &str, now: Instant) -> Option<CacheHit> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        if entry.is_expired(now) {
            self.entries
                .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
            return None;
        }

        let hits = entry.touch(now);
        Some(CacheHit {
            key: entry.key().to_string(),
            value: entry.value().clone(),
            provenance: Provenance::Exact,
            similarity: 1.0,
            hits,
        })
    }

    fn semantic(&self, query: &ScopedEmbedding, now: Instant) -> Option<CacheHit> {
        let scope = query.scope.as_str();
        let live: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .filter(|e| e.value().embedding_in(scope).is_some() && !e.value().is_expired(now))
            .map(|e| Arc::clone(e.value()))
            .collect();

        let (matched, similarity) = best_match(
            &query.vector,
            live.iter()
                .filter_map(|e| e.embedding_in(scope).map(|emb| (e.key(), emb))),
            self.config.snapshot().cache.similarity_threshold,
        )?;
        let entry = live.iter().find(|e| e.key() == matched)?;

        let hits = entry.touch(now);
        debug!(matched = %matched, scope = %scope, similarity = similarity, "Semantic cache hit");
        Some(CacheHit {
            key: entry.key().to_string(),
            value: entry.value().clone(),
            provenance: Provenance::Semantic,
            similarity,
            hits,
        })
    }

    async fn probe_store(&self, key: &str) -> Option<CacheHit> {
        let store = self.durable()?;
        let bytes = match store.get(&storage_key(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.metrics.record_cache_unavailable();
                warn!(key = %key, error = %err, "Durable cache tier unavailable, treating as miss");
                return None;
            }
        };

        let persisted: PersistedEntry = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(key = %key, error = %err, "Unreadable durable cache entry");
                return None;
            }
        };
        let entry = Arc::new(persisted.into_entry()?);
        let hits = entry.touch(Instant::now());
        let hit = CacheHit {
            key: entry.key().to_string(),
            value: entry.value().clone(),
            provenance: Provenance::Exact,
            similarity: 1.0,
            hits,
        };
        self.insert(entry);
        Some(hit)
    }

    /// Store a value with the given TTL (the configured default if `None`)
    pub async fn store(
        &self,
        key: &str,
        embedding: Option<ScopedEmbedding>,
        value: Value,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or_else(|| self.config.snapshot().cache.default_ttl());
        let entry = Arc::new(CacheEntry::new(key, embedding, value, ttl));
        let persisted = self.durable().map(|_| entry.to_persisted(Instant::now()));
        self.insert(entry);

        if let (Some(store), Some(persisted)) = (self.durable(), persisted) {
            let bytes = match serde_json::to_vec(&persisted) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(key = %key, error = %err, "Failed to encode cache entry");
                    return;
                }
            };
            if let Err(err) = store.set(&storage_key(key), bytes).await {
                self.metrics.record_cache_unavailable();
                warn!(key = %key, error = %err, "Durable cache write failed");
            }
        }
    }

    fn insert(&self, entry: Arc<CacheEntry>) {
        self.entries.insert(entry.key().to_string(), entry);
        let settings = self.settings();
        if self.entries.len() > settings.max_entries {
            self.evict(&settings);
        }
    }

    /// Bring the cache back under its size cap
    ///
    /// Expired entries go first, then least-recently-used. Entries at the
    /// promotion threshold are spared once (their hit count resets); if only
    /// spared entries remain, the oldest of those go too.
    fn evict(&self, settings: &CacheConfig) -> u64 {
        let now = Instant::now();
        let mut evicted = 0;

        let mut candidates: Vec<Arc<CacheEntry>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();

        candidates.retain(|entry| {
            if entry.is_expired(now) && self.remove_entry(entry) {
                evicted += 1;
                false
            } else {
                true
            }
        });

        candidates.sort_by_key(|entry| entry.last_access());
        let mut spared = Vec::new();
        for entry in candidates {
            if self.entries.len() <= settings.max_entries {
                break;
            }
            if settings.promotion_threshold > 0 && entry.hits() >= settings.promotion_threshold {
                entry.reset_hits();
                spared.push(entry);
                continue;
            }
            if self.remove_entry(&entry) {
                evicted += 1;
            }
        }

        for entry in spared {
            if self.entries.len() <= settings.max_entries {
                break;
            }
            if self.remove_entry(&entry) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.metrics.record_cache_evictions(evicted);
            debug!(evicted, remaining = self.entries.len(), "Cache eviction cycle");
        }
        evicted
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    /// Return the cached value or run `populate` exactly once per key
    ///
    /// Concurrent callers for the same key wait for the first caller's
    /// population. If it fails, waiting callers get
    /// [`Error::PopulationFailed`] and never invoke `populate` themselves.
    /// A population interrupted by its own caller's cancellation or deadline
    /// is not shared: the next waiting caller populates instead.
    pub async fn get_or_populate<F, Fut>(
        &self,
        key: &str,
        embedding: Option<ScopedEmbedding>,
        ttl: Option<Duration>,
        populate: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(hit) = self.lookup(key, embedding.as_ref()).await {
            return Ok(CacheOutcome {
                value: hit.value,
                source: CacheSource::Hit(hit.provenance),
            });
        }

        let cell: PopulationCell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut led = false;
        let mut leader_error: Option<Error> = None;
        let led_flag = &mut led;
        let error_slot = &mut leader_error;
        let initialised = cell
            .get_or_try_init(move || async move {
                *led_flag = true;
                // A population may have finished between our miss and now
                if let Some(hit) = self.exact(key, Instant::now()) {
                    return Ok(Ok(hit.value));
                }
                match populate().await {
                    Ok(value) => {
                        self.store(key, embedding, value.clone(), ttl).await;
                        Ok(Ok(value))
                    }
                    // Leaves the cell empty for the next waiter
                    Err(err @ (Error::Cancelled | Error::DeadlineExceeded)) => Err(err),
                    Err(err) => {
                        let reason = err.to_string();
                        *error_slot = Some(err);
                        Ok(Err(reason))
                    }
                }
            })
            .await;

        let shared = match initialised {
            Ok(shared) => shared.clone(),
            Err(interrupted) => {
                // Waiters still hold the cell and one of them takes over
                self.in_flight.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &cell) && Arc::strong_count(current) <= 2
                });
                debug!(key = %key, error = %interrupted, "Population interrupted, handing over");
                return Err(interrupted);
            }
        };

        if led {
            self.in_flight
                .remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        }

        match (shared, led) {
            (Ok(value), true) => Ok(CacheOutcome {
                value,
                source: CacheSource::Populated,
            }),
            (Ok(value), false) => Ok(CacheOutcome {
                value,
                source: CacheSource::Coalesced,
            }),
            (Err(reason), true) => Err(leader_error.unwrap_or(Error::PopulationFailed {
                key: key.to_string(),
                reason,
            })),
            (Err(reason), false) => Err(Error::PopulationFailed {
                key: key.to_string(),
                reason,
            }),
        }
    }

    /// Drop a key from every tier
    pub async fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if let Some(store) = self.durable() {
            if let Err(err) = store.delete(&storage_key(key)).await {
                self.metrics.record_cache_unavailable();
                warn!(key = %key, error = %err, "Durable cache delete failed");
            }
        }
        removed
    }

    /// Remove every expired in-memory entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            with_embeddings: self
                .entries
                .iter()
                .filter(|e| e.value().embedding().is_some())
                .count(),
            in_flight: self.in_flight.len(),
        }
    }
}

impl std::fmt::Debug for LayeredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache")
            .field("entries", &self.entries.len())
            .field("in_flight", &self.in_flight.len())
            .field("durable", &self.durable().is_some())
            .finish()
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}
