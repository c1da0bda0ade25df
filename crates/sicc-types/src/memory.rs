//! Memory chunk types: ids, chunk kinds, knowledge layers, filters.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// System-wide embedding dimension. Every stored vector has exactly this length.
pub const EMBEDDING_DIM: usize = 384;

/// Default upper bound on a chunk's content, in bytes.
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 2048;

/// Reserved metadata keys shared by memory chunks and behavior patterns.
pub mod meta_keys {
    /// Knowledge layer: `individual`, `company` or `base`.
    pub const LAYER: &str = "layer";
    /// Company scope, required for the company layer.
    pub const COMPANY_ID: &str = "company_id";
    /// Integer mirror of the layer order.
    pub const PRIORITY: &str = "priority";
    /// Niche version that installed a base-layer row.
    pub const VERSION_ID: &str = "version_id";
    /// Where the knowledge came from.
    pub const SOURCE: &str = "source";
}

/// Open key-value metadata map.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Unique identifier for a memory chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random MemoryId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Closed set of memory chunk categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Question and answer.
    Faq,
    /// Domain vocabulary.
    BusinessTerm,
    /// A business process description.
    Process,
    /// Product information.
    Product,
    /// Knowledge installed through layering.
    LayeredKnowledge,
    /// Full audio transcription.
    TranscriptionFull,
    /// A segment of an audio transcription.
    TranscriptionSegment,
}

impl ChunkType {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Faq => "faq",
            Self::BusinessTerm => "business_term",
            Self::Process => "process",
            Self::Product => "product",
            Self::LayeredKnowledge => "layered_knowledge",
            Self::TranscriptionFull => "transcription_full",
            Self::TranscriptionSegment => "transcription_segment",
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "faq" => Ok(Self::Faq),
            "business_term" => Ok(Self::BusinessTerm),
            "process" => Ok(Self::Process),
            "product" => Ok(Self::Product),
            "layered_knowledge" => Ok(Self::LayeredKnowledge),
            "transcription_full" => Ok(Self::TranscriptionFull),
            "transcription_segment" => Ok(Self::TranscriptionSegment),
            other => Err(format!("unknown chunk type '{other}'")),
        }
    }
}

/// Knowledge layer. Higher priority wins on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Learned from the agent's own conversations.
    Individual,
    /// Shared by agents serving the same company.
    Company,
    /// Installed for a whole niche by propagation.
    Base,
}

impl Layer {
    /// Layer priority: individual (3) > company (2) > base (1).
    pub fn priority(&self) -> i64 {
        match self {
            Self::Individual => 3,
            Self::Company => 2,
            Self::Base => 1,
        }
    }

    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Company => "company",
            Self::Base => "base",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(Self::Individual),
            "company" => Ok(Self::Company),
            "base" => Ok(Self::Base),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// Taken from a conversation.
    Conversation,
    /// Entered by an operator.
    Manual,
    /// Consolidated by the learning pipeline.
    IsaAnalysis,
    /// Derived from an audio transcription.
    AudioTranscription,
}

impl MemorySource {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Manual => "manual",
            Self::IsaAnalysis => "isa_analysis",
            Self::AudioTranscription => "audio_transcription",
        }
    }
}

impl std::str::FromStr for MemorySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "manual" => Ok(Self::Manual),
            "isa_analysis" => Ok(Self::IsaAnalysis),
            "audio_transcription" => Ok(Self::AudioTranscription),
            other => Err(format!("unknown memory source '{other}'")),
        }
    }
}

/// A single remembered fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    /// Unique ID.
    pub id: MemoryId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Owning client.
    pub client_id: String,
    /// Free text content.
    pub content: String,
    /// Category.
    pub chunk_type: ChunkType,
    /// Embedding vector, always `EMBEDDING_DIM` long.
    pub embedding: Vec<f32>,
    /// Open metadata, including the reserved layer keys.
    pub metadata: Metadata,
    /// How the chunk was created.
    pub source: MemorySource,
    /// How many replies this chunk has shaped.
    pub usage_count: u64,
    /// Confidence (0.0 - 1.0).
    pub confidence_score: f32,
    /// Inactive chunks are ignored by search.
    pub is_active: bool,
    /// When the chunk was created.
    pub created_at: DateTime<Utc>,
}

impl MemoryChunk {
    /// The chunk's knowledge layer (defaults to individual).
    pub fn layer(&self) -> Layer {
        layer_of(&self.metadata)
    }

    /// Company scope, if any.
    pub fn company_id(&self) -> Option<&str> {
        self.metadata.get(meta_keys::COMPANY_ID).and_then(|v| v.as_str())
    }

    /// Niche version that installed this chunk, if any.
    pub fn version_id(&self) -> Option<&str> {
        self.metadata.get(meta_keys::VERSION_ID).and_then(|v| v.as_str())
    }
}

/// Input for creating a memory chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemoryChunk {
    /// Owning agent.
    pub agent_id: AgentId,
    /// Owning client.
    pub client_id: String,
    /// Free text content.
    pub content: String,
    /// Category.
    pub chunk_type: ChunkType,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Open metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// How the chunk was created.
    pub source: MemorySource,
    /// Confidence (0.0 - 1.0).
    pub confidence_score: f32,
}

impl NewMemoryChunk {
    /// A manual, individual-layer chunk with full confidence.
    pub fn new(
        agent_id: AgentId,
        client_id: impl Into<String>,
        content: impl Into<String>,
        chunk_type: ChunkType,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            agent_id,
            client_id: client_id.into(),
            content: content.into(),
            chunk_type,
            embedding,
            metadata: Metadata::new(),
            source: MemorySource::Manual,
            confidence_score: 1.0,
        }
    }

    /// Set the knowledge layer (and its priority mirror).
    pub fn with_layer(mut self, layer: Layer) -> Self {
        set_layer(&mut self.metadata, layer);
        self
    }

    /// Scope the chunk to a company (company layer).
    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        set_layer(&mut self.metadata, Layer::Company);
        self.metadata.insert(
            meta_keys::COMPANY_ID.to_string(),
            serde_json::Value::String(company_id.into()),
        );
        self
    }

    /// Tag the chunk as installed by a niche version (base layer).
    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        set_layer(&mut self.metadata, Layer::Base);
        self.metadata.insert(
            meta_keys::VERSION_ID.to_string(),
            serde_json::Value::String(version_id.into()),
        );
        self
    }

    /// Override the source.
    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }

    /// Override the confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence_score = confidence;
        self
    }
}

/// Filters for listing an agent's memory chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    /// Only active (true) or inactive (false) chunks.
    pub is_active: Option<bool>,
    /// Only this chunk type.
    pub chunk_type: Option<ChunkType>,
    /// Only this layer.
    pub layer: Option<Layer>,
    /// Metadata equality filters.
    #[serde(default)]
    pub metadata: Metadata,
}

impl MemoryFilter {
    /// Active chunks only.
    pub fn active() -> Self {
        Self {
            is_active: Some(true),
            ..Default::default()
        }
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// The matching chunk.
    pub chunk: MemoryChunk,
    /// Cosine similarity to the query.
    pub similarity: f32,
}

/// Read the layer from a metadata map (missing or unknown means individual).
pub fn layer_of(metadata: &Metadata) -> Layer {
    metadata
        .get(meta_keys::LAYER)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Layer::Individual)
}

/// Write the layer tag and its priority mirror.
pub fn set_layer(metadata: &mut Metadata, layer: Layer) {
    metadata.insert(
        meta_keys::LAYER.to_string(),
        serde_json::Value::String(layer.as_str().to_string()),
    );
    metadata.insert(
        meta_keys::PRIORITY.to_string(),
        serde_json::Value::from(layer.priority()),
    );
}

/// Check the reserved layer keys of a metadata map.
///
/// Returns the layer on success. Does not check that a base-layer
/// `version_id` refers to an existing niche version; stores do that.
pub fn validate_layer_metadata(metadata: &Metadata) -> Result<Layer, String> {
    let layer = match metadata.get(meta_keys::LAYER) {
        None => Layer::Individual,
        Some(serde_json::Value::String(s)) => s.parse::<Layer>()?,
        Some(other) => return Err(format!("layer must be a string, got {other}")),
    };
    let non_empty = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    };
    match layer {
        Layer::Company if !non_empty(meta_keys::COMPANY_ID) => {
            Err("company layer requires a non-empty company_id".to_string())
        }
        Layer::Base if !non_empty(meta_keys::VERSION_ID) => {
            Err("base layer requires a version_id".to_string())
        }
        _ => Ok(layer),
    }
}

/// Normalize text for duplicate detection: trim, lowercase, collapse whitespace.
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_priority_order() {
        assert!(Layer::Individual.priority() > Layer::Company.priority());
        assert!(Layer::Company.priority() > Layer::Base.priority());
    }

    #[test]
    fn test_chunk_type_labels() {
        for t in [
            ChunkType::Faq,
            ChunkType::BusinessTerm,
            ChunkType::TranscriptionSegment,
        ] {
            assert_eq!(t.as_str().parse::<ChunkType>().unwrap(), t);
        }
        assert!("nope".parse::<ChunkType>().is_err());
        assert_eq!(
            serde_json::to_string(&ChunkType::BusinessTerm).unwrap(),
            "\"business_term\""
        );
    }

    #[test]
    fn test_validate_company_requires_company_id() {
        let mut meta = Metadata::new();
        set_layer(&mut meta, Layer::Company);
        assert!(validate_layer_metadata(&meta).is_err());
        meta.insert(meta_keys::COMPANY_ID.into(), "acme".into());
        assert_eq!(validate_layer_metadata(&meta).unwrap(), Layer::Company);
    }

    #[test]
    fn test_validate_base_requires_version() {
        let mut meta = Metadata::new();
        set_layer(&mut meta, Layer::Base);
        assert!(validate_layer_metadata(&meta).is_err());
        meta.insert(meta_keys::VERSION_ID.into(), "v1".into());
        assert_eq!(validate_layer_metadata(&meta).unwrap(), Layer::Base);
    }

    #[test]
    fn test_validate_unknown_layer() {
        let mut meta = Metadata::new();
        meta.insert(meta_keys::LAYER.into(), "global".into());
        assert!(validate_layer_metadata(&meta).is_err());
        assert_eq!(validate_layer_metadata(&Metadata::new()).unwrap(), Layer::Individual);
    }

    #[test]
    fn test_builder_sets_priority_mirror() {
        let chunk = NewMemoryChunk::new(AgentId::new(), "c1", "x", ChunkType::Faq, vec![])
            .with_company("acme");
        assert_eq!(chunk.metadata[meta_keys::LAYER], "company");
        assert_eq!(chunk.metadata[meta_keys::PRIORITY], 2);
        assert_eq!(chunk.metadata[meta_keys::COMPANY_ID], "acme");
    }

    #[test]
    fn test_normalize_content() {
        assert_eq!(normalize_content("  Hello \n  World  "), "hello world");
    }
}
