//! Lexical sparse-vector encoding.
//!
//! Produces the BM25-style term-weight representation stored next to each
//! dense vector in hybrid collections. Token ids are stable 32-bit FNV-1a
//! hashes of the lowercased token, so the same text encodes identically on
//! every machine that writes to a collection.

use std::collections::BTreeMap;

/// Term-frequency saturation constant (BM25 k1).
const K1: f32 = 1.2;

/// A sparse vector: parallel token-id and weight arrays, ids ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dot product against another sparse vector (both id-sorted).
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let mut score = 0.0;
        let (mut i, mut j) = (0, 0);
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    score += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        score
    }
}

/// Split text into index terms: lowercased, split on anything that is not
/// alphanumeric or `_`, single-character terms dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.len() > 1)
        .map(String::from)
        .collect()
}

/// Encode chunk content for storage: term frequency with saturation,
/// `tf * (k1 + 1) / (tf + k1)`.
pub fn encode_document(text: &str) -> SparseVector {
    let mut freqs: BTreeMap<u32, f32> = BTreeMap::new();
    for token in tokenize(text) {
        *freqs.entry(fnv1a32(&token)).or_insert(0.0) += 1.0;
    }

    let mut indices = Vec::with_capacity(freqs.len());
    let mut values = Vec::with_capacity(freqs.len());
    for (id, tf) in freqs {
        indices.push(id);
        values.push(tf * (K1 + 1.0) / (tf + K1));
    }
    SparseVector { indices, values }
}

/// Encode a query: weight = occurrence count per distinct term, then drop
/// the lowest-weighted `drop_ratio` fraction of terms. Ties at the cutoff
/// are dropped in ascending id order so the result is deterministic.
pub fn encode_query(text: &str, drop_ratio: f32) -> SparseVector {
    let mut freqs: BTreeMap<u32, f32> = BTreeMap::new();
    for token in tokenize(text) {
        *freqs.entry(fnv1a32(&token)).or_insert(0.0) += 1.0;
    }
    if freqs.is_empty() {
        return SparseVector {
            indices: Vec::new(),
            values: Vec::new(),
        };
    }

    let drop = ((freqs.len() as f32) * drop_ratio.clamp(0.0, 1.0)).floor() as usize;
    let cutoff = if drop > 0 {
        let mut weights: Vec<f32> = freqs.values().copied().collect();
        weights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        weights[drop - 1]
    } else {
        f32::NEG_INFINITY
    };

    let mut indices = Vec::new();
    let mut values = Vec::new();
    let mut dropped = 0usize;
    for (id, w) in freqs {
        if dropped < drop && w <= cutoff {
            dropped += 1;
            continue;
        }
        indices.push(id);
        values.push(w);
    }
    SparseVector { indices, values }
}

/// 32-bit FNV-1a. Stable across processes, unlike the std hasher.
fn fnv1a32(token: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in token.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_and_filters() {
        let tokens = tokenize("fn main() { let x_y = 42; }");
        assert!(tokens.contains(&"fn".to_string()));
        assert!(tokens.contains(&"main".to_string()));
        assert!(tokens.contains(&"x_y".to_string()));
        assert!(tokens.contains(&"42".to_string()));
        assert!(!tokens.contains(&"x".to_string()));
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode_document("reciprocal rank fusion combines rankings");
        let b = encode_document("reciprocal rank fusion combines rankings");
        assert_eq!(a, b);
    }

    #[test]
    fn indices_are_sorted_ascending() {
        let v = encode_document("alpha beta gamma delta epsilon zeta");
        assert!(v.indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn repeated_terms_saturate() {
        let once = encode_document("retry");
        let many = encode_document("retry retry retry retry retry retry");
        assert_eq!(once.indices, many.indices);
        let (w1, wn) = (once.values[0], many.values[0]);
        assert!(wn > w1);
        // Saturates below k1 + 1.
        assert!(wn < K1 + 1.0);
    }

    #[test]
    fn dot_product_matches_shared_terms() {
        let doc = encode_document("hash cache diff");
        let query = encode_query("cache", 0.0);
        assert!(doc.dot(&query) > 0.0);

        let unrelated = encode_query("zeppelin", 0.0);
        assert_eq!(doc.dot(&unrelated), 0.0);
    }

    #[test]
    fn empty_text_encodes_empty() {
        assert!(encode_document("").is_empty());
        assert!(encode_query("   ", 0.2).is_empty());
    }

    #[test]
    fn drop_ratio_trims_lowest_weights() {
        // Five distinct terms, one of them repeated so it outweighs the rest.
        let v = encode_query("alpha alpha beta gamma delta epsilon", 0.2);
        // 20% of 5 terms = 1 dropped.
        assert_eq!(v.indices.len(), 4);
        // The repeated term survives.
        let alpha = fnv1a32("alpha");
        assert!(v.indices.contains(&alpha));
    }

    #[test]
    fn fnv_is_stable() {
        // Pinned value: changing the hash breaks every existing collection.
        assert_eq!(fnv1a32(""), 0x811c9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c292c);
    }
}
