//! Built-in deterministic embedding models.
//!
//! Hashed bag-of-words: every content token is hashed (FNV-1a 64) into
//! signed buckets of a 384-d vector with sublinear term weight
//! `1 + ln(tf)`, then the vector is L2-normalized. No model files, no
//! network; equal input always yields a bit-identical vector.

use crate::embedding::{EmbeddingDriver, EmbeddingError};
use crate::text::tokenize;
use async_trait::async_trait;
use sicc_types::memory::EMBEDDING_DIM;
use std::collections::BTreeMap;

/// Two buckets per token.
pub const HASHED_BOW: &str = "hashed-bow-384";
/// One bucket per token; the fallback model.
pub const HASHED_BOW_LITE: &str = "hashed-bow-lite-384";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u8, token: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in std::iter::once(seed).chain(token.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A hashed bag-of-words model.
#[derive(Debug, Clone)]
pub struct HashedEmbeddingDriver {
    name: &'static str,
    buckets_per_token: u8,
    dims: usize,
}

impl HashedEmbeddingDriver {
    /// Look a built-in model up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            HASHED_BOW => Some(Self {
                name: HASHED_BOW,
                buckets_per_token: 2,
                dims: EMBEDDING_DIM,
            }),
            HASHED_BOW_LITE => Some(Self {
                name: HASHED_BOW_LITE,
                buckets_per_token: 1,
                dims: EMBEDDING_DIM,
            }),
            _ => None,
        }
    }

    /// Model name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Encode one text synchronously.
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut tf: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokenize(text) {
            *tf.entry(token).or_insert(0) += 1;
        }
        let mut vector = vec![0.0f32; self.dims];
        let spread = (self.buckets_per_token as f32).sqrt();
        for (token, count) in &tf {
            let weight = (1.0 + (*count as f32).ln()) / spread;
            for seed in 0..self.buckets_per_token {
                let hash = fnv1a(seed, token);
                let bucket = (hash % self.dims as u64) as usize;
                let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign * weight;
            }
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingDriver for HashedEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
