//! Frozen copies of an agent's active memories and patterns.

use crate::agent::AgentId;
use crate::memory::{MemoryChunk, Metadata};
use crate::pattern::BehaviorPattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved snapshot metadata key for the snapshot kind.
pub const SNAPSHOT_TYPE_KEY: &str = "type";

/// Snapshot kind tag created before a niche propagation.
pub const SNAPSHOT_TYPE_PRE_PROPAGATION: &str = "pre_propagation";

/// Snapshot kind tag for operator-created snapshots.
pub const SNAPSHOT_TYPE_MANUAL: &str = "manual";

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    /// Create a new random SnapshotId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SnapshotId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The frozen state captured by a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Active memory chunks at capture time.
    pub memories: Vec<MemoryChunk>,
    /// Active behavior patterns at capture time.
    pub patterns: Vec<BehaviorPattern>,
}

/// Snapshot header (payload loaded separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique ID.
    pub id: SnapshotId,
    /// Agent captured.
    pub agent_id: AgentId,
    /// Display name.
    pub name: String,
    /// Open metadata; reserved keys `type` and `version_id`.
    pub metadata: Metadata,
    /// Number of memories in the payload.
    pub memory_count: usize,
    /// Number of patterns in the payload.
    pub pattern_count: usize,
    /// Whether the snapshot can still be restored.
    pub is_active: bool,
    /// When it was captured.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// The snapshot kind tag, if set.
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get(SNAPSHOT_TYPE_KEY).and_then(|v| v.as_str())
    }
}

/// Result of restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Snapshot restored.
    pub snapshot_id: SnapshotId,
    /// Agent restored.
    pub agent_id: AgentId,
    /// Active memories removed before restoring.
    pub memories_removed: usize,
    /// Active patterns removed before restoring.
    pub patterns_removed: usize,
    /// Memories written back.
    pub memories_restored: usize,
    /// Patterns written back.
    pub patterns_restored: usize,
}
