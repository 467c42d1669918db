//! Layered result cache
//!
//! - Exact tier: O(1) lookup on a fingerprint key
//! - Semantic tier: cosine similarity over stored embeddings
//! - Durable tier: optional write-through to a [`KeyValueStore`](crate::storage::KeyValueStore)
//!
//! Entries expire by TTL, are evicted least-recently-used with a promotion
//! exemption for hot entries, and populate at most once per key under
//! concurrent demand.

mod entry;
mod layered;
mod semantic;

use sha2::{Digest, Sha256};

pub use entry::{CacheEntry, CacheHit, Provenance, ScopedEmbedding};
pub use layered::{CACHE_PREFIX, CacheOutcome, CacheSource, CacheStats, LayeredCache};
pub use semantic::{best_match, cosine_similarity};

/// Stable exact-tier key from ordered parts
///
/// Parts are length-prefixed before hashing so `["ab", "c"]` and
/// `["a", "bc"]` differ.
pub fn cache_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
