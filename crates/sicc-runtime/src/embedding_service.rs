//! The embedding service: model loading with fallback, an LRU cache and a
//! process-wide instance.

use crate::embedding::{create_embedding_driver, EmbeddingDriver, EmbeddingError};
use crate::text::normalize;
use lru::LruCache;
use sicc_types::config::EmbeddingSettings;
use sicc_types::memory::EMBEDDING_DIM;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

static GLOBAL: OnceCell<Arc<EmbeddingService>> = OnceCell::const_new();

/// Cached text-to-vector service.
pub struct EmbeddingService {
    driver: Box<dyn EmbeddingDriver + Send + Sync>,
    model: String,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Load the configured model, falling back to `fallback_model` when the
    /// primary cannot be loaded. A dimension mismatch is never recovered from.
    pub fn load(settings: &EmbeddingSettings) -> Result<Self, EmbeddingError> {
        let (driver, model) = match create_embedding_driver(settings, &settings.model) {
            Ok(driver) => (driver, settings.model.clone()),
            Err(e @ EmbeddingError::DimensionMismatch { .. }) => return Err(e),
            Err(e) => {
                warn!(
                    model = %settings.model,
                    fallback = %settings.fallback_model,
                    error = %e,
                    "Embedding model unavailable, loading fallback"
                );
                let local = EmbeddingSettings {
                    provider: "local".to_string(),
                    ..settings.clone()
                };
                let fallback = create_embedding_driver(&local, &settings.fallback_model)
                    .or_else(|_| create_embedding_driver(settings, &settings.fallback_model))?;
                (fallback, settings.fallback_model.clone())
            }
        };
        info!(model = %model, dims = driver.dimensions(), "Embedding model loaded");
        Self::with_driver(driver, model, settings.cache_capacity)
    }

    /// Wrap an already constructed driver.
    pub fn with_driver(
        driver: Box<dyn EmbeddingDriver + Send + Sync>,
        model: impl Into<String>,
        cache_capacity: usize,
    ) -> Result<Self, EmbeddingError> {
        if driver.dimensions() != EMBEDDING_DIM {
            return Err(EmbeddingError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: driver.dimensions(),
            });
        }
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            driver,
            model: model.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Name of the loaded model.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of cached vectors.
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Embed one text. Cache hits return the stored vector unchanged.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Embed many texts in input order with a single driver call for the
    /// cache misses.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let keys: Vec<String> = texts.iter().map(|t| normalize(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; keys.len()];
        let mut misses: Vec<&str> = Vec::new();
        {
            let mut cache = self.lock_cache();
            for (slot, key) in out.iter_mut().zip(&keys) {
                match cache.get(key) {
                    Some(hit) => *slot = Some(hit.clone()),
                    None if !misses.contains(&key.as_str()) => misses.push(key.as_str()),
                    None => {}
                }
            }
        }

        if !misses.is_empty() {
            let vectors = self.driver.embed(&misses).await?;
            if vectors.len() != misses.len() {
                return Err(EmbeddingError::Parse(format!(
                    "expected {} embeddings, got {}",
                    misses.len(),
                    vectors.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != EMBEDDING_DIM) {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: EMBEDDING_DIM,
                    actual: bad.len(),
                });
            }
            debug!(misses = misses.len(), total = keys.len(), "Embedded cache misses");
            let mut cache = self.lock_cache();
            for (key, vector) in misses.iter().zip(vectors) {
                for (slot, k) in out.iter_mut().zip(&keys) {
                    if slot.is_none() && k.as_str() == *key {
                        *slot = Some(vector.clone());
                    }
                }
                cache.put(key.to_string(), vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| EmbeddingError::Parse("missing embedding".to_string())))
            .collect()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Vec<f32>>> {
        // Entries are whole vectors, so a poisoned cache is still consistent.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The process-wide service. The first caller loads the model; concurrent
/// callers wait for it. Later calls ignore `settings`.
pub async fn global(settings: &EmbeddingSettings) -> Result<Arc<EmbeddingService>, EmbeddingError> {
    GLOBAL
        .get_or_try_init(|| async { EmbeddingService::load(settings).map(Arc::new) })
        .await
        .cloned()
}
