//! Cache entries and lookup results

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Which tier answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Exact,
    Semantic,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

/// Embedding tagged with the scope it may be matched within
///
/// Semantic lookups only compare entries whose scope is identical, so a
/// near-duplicate input never crosses tenant, task or stage boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedEmbedding {
    pub scope: String,
    pub vector: Vec<f32>,
}

impl ScopedEmbedding {
    pub fn new(scope: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            scope: scope.into(),
            vector,
        }
    }
}

/// A cached stage payload
///
/// Hit count and last access are atomics so lookups only need a shared
/// reference to the entry.
#[derive(Debug)]
pub struct CacheEntry {
    key: String,
    embedding: Option<ScopedEmbedding>,
    value: serde_json::Value,
    created_at: Instant,
    ttl: Duration,
    hits: AtomicU64,
    /// Microseconds after `created_at` of the last access
    last_access_us: AtomicU64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        embedding: Option<ScopedEmbedding>,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            embedding,
            value,
            created_at: Instant::now(),
            ttl,
            hits: AtomicU64::new(0),
            last_access_us: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_ref().map(|e| e.vector.as_slice())
    }

    /// Embedding vector if this entry is matchable within `scope`
    pub fn embedding_in(&self, scope: &str) -> Option<&[f32]> {
        self.embedding
            .as_ref()
            .filter(|e| e.scope == scope)
            .map(|e| e.vector.as_slice())
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> Instant {
        self.created_at + Duration::from_micros(self.last_access_us.load(Ordering::Relaxed))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }

    /// Count a hit and bump the access time
    pub(crate) fn touch(&self, now: Instant) -> u64 {
        let offset = now.saturating_duration_since(self.created_at).as_micros();
        self.last_access_us
            .fetch_max(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clear the hit count after surviving an eviction cycle
    pub(crate) fn reset_hits(&self) {
        self.hits.store(0, Ordering::Relaxed);
    }

    pub(crate) fn to_persisted(&self, now: Instant) -> PersistedEntry {
        let remaining = chrono::Duration::from_std(self.remaining_ttl(now))
            .unwrap_or_else(|_| chrono::Duration::zero());
        PersistedEntry {
            key: self.key.clone(),
            embedding: self.embedding.clone(),
            value: self.value.clone(),
            expires_at: Utc::now() + remaining,
        }
    }
}

/// On-store representation of an entry
///
/// Expiry is wall-clock so it survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub key: String,
    pub embedding: Option<ScopedEmbedding>,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl PersistedEntry {
    /// Rebuild an in-memory entry with the remaining TTL, if any is left
    pub fn into_entry(self) -> Option<CacheEntry> {
        let remaining = (self.expires_at - Utc::now()).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some(CacheEntry::new(self.key, self.embedding, self.value, remaining))
    }
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Key of the entry that answered (differs from the query on semantic hits)
    pub key: String,
    pub value: serde_json::Value,
    pub provenance: Provenance,
    /// Cosine similarity for semantic hits, 1.0 for exact hits
    pub similarity: f32,
    pub hits: u64,
}
