//! Configuration types. Loaded from `~/.sicc/config.toml` by the kernel.
//!
//! Every field has a default so a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiccConfig {
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Data directory (database lives here unless `database_path` is set).
    pub data_dir: PathBuf,
    /// Explicit database path.
    pub database_path: Option<PathBuf>,
    /// Embedding service settings.
    pub embedding: EmbeddingSettings,
    /// Memory store settings.
    pub memory: MemorySettings,
    /// Prompt enrichment settings.
    pub orchestrator: OrchestratorSettings,
    /// Learning pipeline settings.
    pub learning: LearningSettings,
    /// HTTP shell settings.
    pub api: ApiSettings,
}

impl Default for SiccConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: sicc_home().join("data"),
            database_path: None,
            embedding: EmbeddingSettings::default(),
            memory: MemorySettings::default(),
            orchestrator: OrchestratorSettings::default(),
            learning: LearningSettings::default(),
            api: ApiSettings::default(),
        }
    }
}

impl SiccConfig {
    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sicc.db"))
    }
}

/// Embedding model selection and cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `local` for the built-in hashed models, otherwise an OpenAI-compatible provider.
    pub provider: String,
    /// Primary model name.
    pub model: String,
    /// Model loaded when the primary cannot be.
    pub fallback_model: String,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    /// Provider base URL override.
    pub base_url: Option<String>,
    /// LRU cache capacity (entries).
    pub cache_capacity: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "hashed-bow-384".to_string(),
            fallback_model: "hashed-bow-lite-384".to_string(),
            api_key_env: String::new(),
            base_url: None,
            cache_capacity: 4096,
        }
    }
}

/// Memory store limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Maximum content length in bytes.
    pub max_content_bytes: usize,
    /// Soft per-agent ceiling on active chunks.
    pub agent_memory_quota: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_content_bytes: 2048,
            agent_memory_quota: 10_000,
        }
    }
}

/// Prompt enrichment knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Memories fetched per message.
    pub top_k: usize,
    /// Minimum cosine similarity for a memory to be used.
    pub min_similarity: f32,
    /// Hard prompt budget in tokens.
    pub max_tokens: usize,
    /// Base prompt used when the caller supplies none.
    pub default_base_prompt: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_similarity: 0.5,
            max_tokens: 8000,
            default_base_prompt: String::new(),
        }
    }
}

/// Learning pipeline thresholds and schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    /// Candidates at or above this confidence are consolidated automatically.
    pub auto_approve_threshold: f32,
    /// Candidates below this confidence are rejected automatically.
    pub review_threshold: f32,
    /// Occurrences needed for a business-term candidate.
    pub min_term_frequency: u32,
    /// Jaccard similarity at which two questions are paraphrases.
    pub paraphrase_similarity: f32,
    /// Mean satisfaction a response phrasing needs to become a pattern.
    pub min_satisfaction: f64,
    /// Default analysis window.
    pub time_window_hours: u32,
    /// Conversations shorter than this are ignored.
    pub min_messages: usize,
    /// Seconds between scheduled analysis runs (0 disables the worker).
    pub schedule_interval_secs: u64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 0.8,
            review_threshold: 0.5,
            min_term_frequency: 3,
            paraphrase_similarity: 0.6,
            min_satisfaction: 4.0,
            time_window_hours: 24,
            min_messages: 2,
            schedule_interval_secs: 3600,
        }
    }
}

/// HTTP shell settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Socket address to bind.
    pub listen_addr: String,
    /// GCRA budget per client IP per minute.
    pub rate_limit_per_minute: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4300".to_string(),
            rate_limit_per_minute: 600,
        }
    }
}

/// The SICC home directory (`~/.sicc`).
pub fn sicc_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sicc")
}
