//! Niche versions (base knowledge bundles) and propagation reports.

use crate::agent::AgentId;
use crate::memory::{ChunkType, Metadata};
use crate::pattern::{PatternType, TriggerContext};
use crate::snapshot::SnapshotId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a niche version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NicheVersionId(pub Uuid);

impl NicheVersionId {
    /// Create a new random NicheVersionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NicheVersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NicheVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NicheVersionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a niche version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicheVersionStatus {
    /// Created, never propagated.
    Draft,
    /// At least one agent carries its entries.
    Active,
    /// Every propagation was rolled back.
    RolledBack,
}

impl NicheVersionStatus {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for NicheVersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NicheVersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown niche version status '{other}'")),
        }
    }
}

/// A base-layer memory in a niche bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMemory {
    /// Content of the chunk.
    pub content: String,
    /// Chunk category.
    #[serde(default = "default_bundle_chunk_type")]
    pub chunk_type: ChunkType,
    /// Extra metadata merged under the reserved keys.
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_bundle_chunk_type() -> ChunkType {
    ChunkType::LayeredKnowledge
}

/// A base-layer pattern in a niche bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlePattern {
    /// Pattern name; propagation dedupes on it.
    pub pattern_name: String,
    /// Pattern category.
    pub pattern_type: PatternType,
    /// Trigger predicate.
    #[serde(default)]
    pub trigger_context: TriggerContext,
    /// Action payload.
    #[serde(default)]
    pub action_config: serde_json::Value,
}

/// A versioned base knowledge bundle for a niche.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicheVersion {
    /// Unique ID.
    pub id: NicheVersionId,
    /// Niche tag.
    pub niche_type: String,
    /// Display name.
    pub version_name: String,
    /// Memory bundle.
    pub memories: Vec<BundleMemory>,
    /// Pattern bundle.
    pub patterns: Vec<BundlePattern>,
    /// Lifecycle state.
    pub status: NicheVersionStatus,
    /// The niche's current version (at most one per niche).
    pub is_active: bool,
    /// When the version was created.
    pub created_at: DateTime<Utc>,
}

/// Per-agent status of a propagation or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOpStatus {
    /// The agent now carries (or no longer carries) the version.
    Success,
    /// The agent was left unchanged.
    Error,
    /// Cancellation was observed before reaching the agent.
    Cancelled,
}

/// Per-agent line of a propagation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPropagation {
    /// Target agent.
    pub agent_id: AgentId,
    /// Outcome.
    pub status: AgentOpStatus,
    /// Pre-propagation snapshot taken for the agent.
    pub snapshot_id: Option<SnapshotId>,
    /// Base-layer memories inserted.
    pub memories_inserted: usize,
    /// Base-layer patterns inserted.
    pub patterns_inserted: usize,
    /// Bundle entries skipped as duplicates.
    pub skipped_duplicates: usize,
    /// Error text when `status` is `error`.
    pub error: Option<String>,
}

/// Aggregated propagation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    /// Version propagated.
    pub version_id: NicheVersionId,
    /// Per-agent outcomes.
    pub agents: Vec<AgentPropagation>,
}

impl PropagationReport {
    /// Number of agents that ended with `status`.
    pub fn count(&self, status: AgentOpStatus) -> usize {
        self.agents.iter().filter(|a| a.status == status).count()
    }
}

/// Per-agent line of a rollback report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRollback {
    /// Target agent.
    pub agent_id: AgentId,
    /// Outcome.
    pub status: AgentOpStatus,
    /// Whether the pre-propagation snapshot was restored.
    pub restored_snapshot: bool,
    /// Rows carrying the version id that were deleted.
    pub rows_deleted: usize,
    /// Error text when `status` is `error`.
    pub error: Option<String>,
}

/// Aggregated rollback report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Version rolled back.
    pub version_id: NicheVersionId,
    /// Per-agent outcomes; empty when nothing was left to roll back.
    pub agents: Vec<AgentRollback>,
}

/// Persistent record of one version propagated to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationRecord {
    /// Version.
    pub version_id: NicheVersionId,
    /// Agent.
    pub agent_id: AgentId,
    /// Pre-propagation snapshot, if one was taken.
    pub snapshot_id: Option<SnapshotId>,
    /// Memories inserted by the latest propagation.
    pub memories_inserted: usize,
    /// Patterns inserted by the latest propagation.
    pub patterns_inserted: usize,
    /// When the version was (last) propagated to the agent.
    pub propagated_at: DateTime<Utc>,
    /// When it was rolled back, if it was.
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_memory_defaults() {
        let m: BundleMemory = serde_json::from_str(r#"{"content":"Horário: 9h às 18h"}"#).unwrap();
        assert_eq!(m.chunk_type, ChunkType::LayeredKnowledge);
        assert!(m.metadata.is_empty());
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(
            "rolled_back".parse::<NicheVersionStatus>().unwrap(),
            NicheVersionStatus::RolledBack
        );
        assert_eq!(NicheVersionStatus::Draft.as_str(), "draft");
    }
}
