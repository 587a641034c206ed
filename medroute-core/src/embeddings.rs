//! Embedding providers used by the retriever.
//!
//! The local embedder hashes term frequencies into a fixed number of
//! dimensions and L2-normalizes the result, so it needs no model download
//! and is fully deterministic.

use std::collections::HashMap;

/// Trait for embedding providers.
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Generate embeddings for a batch of texts.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Hashed term-frequency embedder.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

/// djb2 string hash.
fn term_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

/// Lowercased alphanumeric terms of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let terms = tokenize(text);
        if terms.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            *tf.entry(term.as_str()).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            vector[term_hash(term) % self.dimensions] += *count as f32;
        }

        normalize(&mut vector);
        vector
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity between two vectors. Returns 0.0 on length mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_embedder_dimensions() {
        let embedder = LocalEmbedder::new(64);
        let v = embedder.embed("metformin lowers blood sugar");
        assert_eq!(v.len(), 64);
        assert_eq!(embedder.dimensions(), 64);
        assert_eq!(embedder.provider_name(), "local");
    }

    #[test]
    fn test_local_embedder_is_normalized() {
        let v = LocalEmbedder::default().embed("aspirin aspirin ibuprofen");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_local_embedder_empty_text() {
        let v = LocalEmbedder::new(16).embed("  ?! ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_identical_texts_have_similarity_one() {
        let e = LocalEmbedder::default();
        let a = e.embed("Side effects of metformin");
        let b = e.embed("side effects of METFORMIN");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_embed_batch_matches_single() {
        let e = LocalEmbedder::new(32);
        let batch = e.embed_batch(&["fever", "cough"]);
        assert_eq!(batch[0], e.embed("fever"));
        assert_eq!(batch[1], e.embed("cough"));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Can't sleep, 2 nights!"), vec!["can", "t", "sleep", "2", "nights"]);
    }
}
