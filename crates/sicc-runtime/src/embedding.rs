//! Embedding drivers.
//!
//! Provides an `EmbeddingDriver` trait, the built-in hashed models (see
//! [`crate::hashed`]) and an OpenAI-compatible implementation that works with
//! any provider offering a `/v1/embeddings` endpoint (OpenAI, Ollama, vLLM,
//! LM Studio, etc.). Every driver must produce 384-d vectors.

use crate::hashed::HashedEmbeddingDriver;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sicc_types::config::EmbeddingSettings;
use sicc_types::error::SiccError;
use sicc_types::memory::EMBEDDING_DIM;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const VLLM_BASE_URL: &str = "http://localhost:8000/v1";
pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<EmbeddingError> for SiccError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::DimensionMismatch { .. } => SiccError::Validation(e.to_string()),
            other => SiccError::Upstream(other.to_string()),
        }
    }
}

/// Configuration for creating an HTTP embedding driver.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider name (openai, ollama, vllm, etc.).
    pub provider: String,
    /// Model name (e.g., "all-MiniLM-L6-v2").
    pub model: String,
    /// API key (resolved from env var).
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
}

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    /// Compute embedding vectors for a batch of texts, in input order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Compute embedding for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Return the dimensionality of embeddings produced by this driver.
    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible embedding driver.
pub struct OpenAIEmbeddingDriver {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl OpenAIEmbeddingDriver {
    /// Create a new OpenAI-compatible embedding driver.
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let dims = infer_dimensions(&config.model)
            .ok_or_else(|| EmbeddingError::UnknownModel(config.model.clone()))?;
        Ok(Self {
            api_key: Zeroizing::new(config.api_key),
            base_url: config.base_url,
            model: config.model,
            client: reqwest::Client::new(),
            dims,
        })
    }
}

/// Known embedding dimensions by model name.
fn infer_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "all-MiniLM-L6-v2" | "all-MiniLM-L12-v2" | "paraphrase-multilingual-MiniLM-L12-v2" => {
            Some(384)
        }
        "all-mpnet-base-v2" | "nomic-embed-text" => Some(768),
        "mxbai-embed-large" => Some(1024),
        _ => None,
    }
}

#[async_trait]
impl EmbeddingDriver for OpenAIEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.as_str().is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let status = resp.status().as_u16();

        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status,
                message: body_text,
            });
        }

        let data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        let embeddings: Vec<Vec<f32>> = data.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        debug!(
            "Embedded {} texts (dims={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Create the driver for one model name. `local` resolves the built-in
/// hashed models; anything else is an OpenAI-compatible provider.
pub fn create_embedding_driver(
    settings: &EmbeddingSettings,
    model: &str,
) -> Result<Box<dyn EmbeddingDriver + Send + Sync>, EmbeddingError> {
    let driver: Box<dyn EmbeddingDriver + Send + Sync> = if settings.provider == "local" {
        let hashed = HashedEmbeddingDriver::from_name(model)
            .ok_or_else(|| EmbeddingError::UnknownModel(model.to_string()))?;
        Box::new(hashed)
    } else {
        Box::new(create_http_driver(settings, model)?)
    };
    if driver.dimensions() != EMBEDDING_DIM {
        return Err(EmbeddingError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: driver.dimensions(),
        });
    }
    Ok(driver)
}

fn create_http_driver(
    settings: &EmbeddingSettings,
    model: &str,
) -> Result<OpenAIEmbeddingDriver, EmbeddingError> {
    let provider = settings.provider.as_str();
    let api_key = if settings.api_key_env.is_empty() {
        String::new()
    } else {
        std::env::var(&settings.api_key_env).unwrap_or_default()
    };

    let base_url = match (&settings.base_url, provider) {
        (Some(url), _) => url.trim_end_matches('/').to_string(),
        (None, "openai") => OPENAI_BASE_URL.to_string(),
        (None, "ollama") => OLLAMA_BASE_URL.to_string(),
        (None, "vllm") => VLLM_BASE_URL.to_string(),
        (None, "lmstudio") => LMSTUDIO_BASE_URL.to_string(),
        (None, other) => {
            warn!("Unknown embedding provider '{other}', using OpenAI-compatible format");
            format!("https://{other}/v1")
        }
    };

    let is_local = base_url.contains("localhost")
        || base_url.contains("127.0.0.1")
        || base_url.contains("[::1]");
    if !is_local && api_key.is_empty() {
        return Err(EmbeddingError::MissingApiKey(settings.api_key_env.clone()));
    }
    if !is_local {
        warn!(
            provider = %provider,
            base_url = %base_url,
            "Embedding driver configured to send data to external API; text content will leave this machine"
        );
    }

    OpenAIEmbeddingDriver::new(EmbeddingConfig {
        provider: provider.to_string(),
        model: model.to_string(),
        api_key,
        base_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashed::{HASHED_BOW, HASHED_BOW_LITE};

    fn settings(provider: &str) -> EmbeddingSettings {
        EmbeddingSettings {
            provider: provider.to_string(),
            ..EmbeddingSettings::default()
        }
    }

    #[test]
    fn test_infer_dimensions() {
        assert_eq!(infer_dimensions("text-embedding-3-small"), Some(1536));
        assert_eq!(infer_dimensions("all-MiniLM-L6-v2"), Some(384));
        assert_eq!(infer_dimensions("unknown-model"), None);
    }

    #[test]
    fn test_local_models() {
        let local = settings("local");
        assert_eq!(
            create_embedding_driver(&local, HASHED_BOW).unwrap().dimensions(),
            EMBEDDING_DIM
        );
        assert!(create_embedding_driver(&local, HASHED_BOW_LITE).is_ok());
        assert!(matches!(
            create_embedding_driver(&local, "missing"),
            Err(EmbeddingError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_http_driver_dimension_is_checked() {
        // Ollama is local, so no API key is needed.
        let ollama = settings("ollama");
        assert!(create_embedding_driver(&ollama, "all-MiniLM-L6-v2").is_ok());
        assert!(matches!(
            create_embedding_driver(&ollama, "nomic-embed-text"),
            Err(EmbeddingError::DimensionMismatch { expected: 384, actual: 768 })
        ));
    }

    #[test]
    fn test_remote_provider_requires_key() {
        let mut openai = settings("openai");
        openai.api_key_env = "SICC_TEST_UNSET_EMBEDDING_KEY".into();
        assert!(matches!(
            create_embedding_driver(&openai, "all-MiniLM-L6-v2"),
            Err(EmbeddingError::MissingApiKey(_))
        ));
    }

    #[test]
    fn test_error_kind_mapping() {
        let err: SiccError = EmbeddingError::DimensionMismatch {
            expected: 384,
            actual: 768,
        }
        .into();
        assert_eq!(err.kind(), "validation");
        let err: SiccError = EmbeddingError::Http("refused".into()).into();
        assert_eq!(err.kind(), "upstream");
    }
}
