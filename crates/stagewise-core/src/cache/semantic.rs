//! Semantic tier - brute-force cosine similarity over cached embeddings

/// Cosine similarity between two vectors
///
/// Returns 0.0 for mismatched lengths or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Best candidate at or above `threshold`
///
/// Ties keep the first candidate seen.
pub fn best_match<'a, I>(query: &[f32], candidates: I, threshold: f32) -> Option<(&'a str, f32)>
where
    I: IntoIterator<Item = (&'a str, &'a [f32])>,
{
    let mut best: Option<(&'a str, f32)> = None;
    for (key, embedding) in candidates {
        let score = cosine_similarity(query, embedding);
        if score < threshold {
            continue;
        }
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((key, score));
        }
    }
    best
}
