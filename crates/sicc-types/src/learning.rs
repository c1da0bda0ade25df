//! Candidate learnings, their review lifecycle and analysis reports.

use crate::agent::AgentId;
use crate::memory::ChunkType;
use crate::pattern::{PatternType, TriggerContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reviewer identity used for threshold-based automatic decisions.
pub const AUTO_REVIEWER: &str = "system:auto";

/// Unique identifier for a learning log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LearningId(pub Uuid);

impl LearningId {
    /// Create a new random LearningId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LearningId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LearningId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LearningId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What consolidating the learning does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    /// Adds a memory chunk.
    MemoryAdded,
    /// Adds a behavior pattern.
    PatternAdded,
    /// Strengthens an existing pattern.
    PatternReinforced,
    /// Strengthens an existing memory.
    MemoryReinforced,
}

impl LearningType {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryAdded => "memory_added",
            Self::PatternAdded => "pattern_added",
            Self::PatternReinforced => "pattern_reinforced",
            Self::MemoryReinforced => "memory_reinforced",
        }
    }
}

impl std::fmt::Display for LearningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LearningType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_added" => Ok(Self::MemoryAdded),
            "pattern_added" => Ok(Self::PatternAdded),
            "pattern_reinforced" => Ok(Self::PatternReinforced),
            "memory_reinforced" => Ok(Self::MemoryReinforced),
            other => Err(format!("unknown learning type '{other}'")),
        }
    }
}

/// Review state of a learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    /// Awaiting human review.
    Pending,
    /// Approved, consolidation in progress.
    Approved,
    /// Rejected by a reviewer or a rule.
    Rejected,
    /// Consolidated into the durable store.
    Applied,
}

impl LearningStatus {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
        }
    }
}

impl std::fmt::Display for LearningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LearningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "applied" => Ok(Self::Applied),
            other => Err(format!("unknown learning status '{other}'")),
        }
    }
}

/// The knowledge a learning would consolidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
    /// A memory chunk candidate.
    Memory {
        /// Content of the chunk to create.
        content: String,
        /// Chunk category.
        chunk_type: ChunkType,
    },
    /// A behavior pattern candidate.
    Pattern {
        /// Pattern name.
        pattern_name: String,
        /// Pattern category.
        pattern_type: PatternType,
        /// Trigger predicate.
        trigger_context: TriggerContext,
        /// Action payload.
        action_config: serde_json::Value,
    },
}

impl Candidate {
    /// Text used to detect repeated candidates across analysis runs.
    pub fn dedupe_key(&self) -> String {
        match self {
            Self::Memory { content, .. } => crate::memory::normalize_content(content),
            Self::Pattern { pattern_name, .. } => format!("pattern:{pattern_name}"),
        }
    }
}

/// Raw excerpt plus the derived candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceData {
    /// Excerpt of the transcripts that produced the candidate.
    pub excerpt: String,
    /// The candidate itself.
    pub candidate: Candidate,
    /// How many times the signal was observed.
    #[serde(default)]
    pub occurrences: u32,
    /// How many distinct conversations showed the signal.
    #[serde(default)]
    pub conversations: u32,
}

/// Heuristic findings attached to a learning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Label of the heuristic that fired.
    pub detected_pattern: String,
    /// Human-readable recommendation for the reviewer.
    pub recommendation: String,
}

/// A candidate learning and its review trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningLog {
    /// Unique ID.
    pub id: LearningId,
    /// Agent whose transcripts produced the learning.
    pub agent_id: AgentId,
    /// What consolidation does.
    pub learning_type: LearningType,
    /// Excerpt and candidate.
    pub source_data: SourceData,
    /// Heuristic findings.
    pub analysis: Analysis,
    /// Heuristic confidence (0.0 - 1.0).
    pub confidence: f32,
    /// Review state.
    pub status: LearningStatus,
    /// Who reviewed it.
    pub reviewed_by: Option<String>,
    /// When it was reviewed.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Rejection reason or consolidation note.
    pub review_note: Option<String>,
    /// When the candidate was proposed.
    pub created_at: DateTime<Utc>,
}

/// Input for recording a candidate learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLearning {
    /// Agent whose transcripts produced the learning.
    pub agent_id: AgentId,
    /// What consolidation does.
    pub learning_type: LearningType,
    /// Excerpt and candidate.
    pub source_data: SourceData,
    /// Heuristic findings.
    pub analysis: Analysis,
    /// Heuristic confidence (0.0 - 1.0).
    pub confidence: f32,
}

/// Why an approval failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFailure {
    /// The consolidated row would duplicate an active one.
    Duplicate,
    /// The learning was already reviewed.
    NotPending,
    /// The store or embedding model was unavailable.
    Upstream,
    /// No learning with that id.
    NotFound,
}

impl ReviewFailure {
    /// Stable label surfaced to reviewers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NotPending => "not_pending",
            Self::Upstream => "upstream",
            Self::NotFound => "not_found",
        }
    }
}

impl From<&crate::error::SiccError> for ReviewFailure {
    fn from(err: &crate::error::SiccError) -> Self {
        use crate::error::SiccError;
        match err {
            SiccError::ReviewFailed(failure) => *failure,
            SiccError::NotFound { .. } => Self::NotFound,
            SiccError::Conflict(_) => Self::NotPending,
            _ => Self::Upstream,
        }
    }
}

impl std::fmt::Display for ReviewFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item result of a (batch) review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// The learning reviewed.
    pub id: LearningId,
    /// Whether the review went through.
    pub success: bool,
    /// Resulting status, when known.
    pub status: Option<LearningStatus>,
    /// Failure reason, when `success` is false.
    pub error: Option<ReviewFailure>,
}

/// Outcome for one candidate produced by an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    /// Learning log id, when the candidate was recorded.
    pub learning_id: Option<LearningId>,
    /// Learning type.
    pub learning_type: LearningType,
    /// Heuristic label.
    pub detected_pattern: String,
    /// Confidence.
    pub confidence: f32,
    /// Status after routing.
    pub status: Option<LearningStatus>,
    /// Error text if recording or consolidation failed.
    pub error: Option<String>,
}

/// Aggregated report of one `analyze_conversations` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Agent analyzed.
    pub agent_id: AgentId,
    /// Conversations that passed the `min_messages` filter.
    pub conversations_analyzed: usize,
    /// Per-candidate outcomes.
    pub candidates: Vec<CandidateOutcome>,
    /// Whether the run observed a cancellation.
    pub cancelled: bool,
}

impl AnalysisReport {
    /// Number of candidates that ended in `status`.
    pub fn count(&self, status: LearningStatus) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.status == Some(status))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_serialization_is_tagged() {
        let c = Candidate::Memory {
            content: "plano premium".into(),
            chunk_type: ChunkType::BusinessTerm,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["kind"], "memory");
        assert_eq!(json["chunk_type"], "business_term");
        let back: Candidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_dedupe_key_normalizes() {
        let a = Candidate::Memory {
            content: "  Plano   Premium ".into(),
            chunk_type: ChunkType::BusinessTerm,
        };
        assert_eq!(a.dedupe_key(), "plano premium");
    }

    #[test]
    fn test_status_labels() {
        assert_eq!("applied".parse::<LearningStatus>().unwrap(), LearningStatus::Applied);
        assert_eq!(ReviewFailure::NotPending.as_str(), "not_pending");
    }
}
