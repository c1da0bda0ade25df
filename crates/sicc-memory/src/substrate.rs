//! The substrate: every store over one shared SQLite connection.

use crate::behavior::BehaviorStore;
use crate::consolidation::PruneEngine;
use crate::learning::LearningStore;
use crate::metrics::MetricsStore;
use crate::migration::run_migrations;
use crate::niche::NicheStore;
use crate::registry::AgentStore;
use crate::semantic::MemoryStore;
use crate::session::ConversationStore;
use crate::snapshot::SnapshotStore;
use rusqlite::Connection;
use sicc_types::agent::AgentId;
use sicc_types::config::MemorySettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::ScoredChunk;
use sicc_types::pattern::{BehaviorPattern, RuntimeContext};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// All stores of the SICC core, sharing one connection.
#[derive(Clone)]
pub struct SiccSubstrate {
    memory: MemoryStore,
    behavior: BehaviorStore,
    learnings: LearningStore,
    metrics: MetricsStore,
    snapshots: SnapshotStore,
    niches: NicheStore,
    agents: AgentStore,
    conversations: ConversationStore,
    pruner: PruneEngine,
}

impl SiccSubstrate {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, settings: &MemorySettings) -> SiccResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SiccError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| SiccError::Storage(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| SiccError::Storage(e.to_string()))?;
        run_migrations(&conn).map_err(|e| SiccError::Storage(e.to_string()))?;
        info!(path = %path.display(), "SICC database opened");
        Ok(Self::from_connection(conn, settings))
    }

    /// A fresh in-memory database (tests and ephemeral runs).
    pub fn open_in_memory(settings: &MemorySettings) -> SiccResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SiccError::Storage(e.to_string()))?;
        run_migrations(&conn).map_err(|e| SiccError::Storage(e.to_string()))?;
        Ok(Self::from_connection(conn, settings))
    }

    fn from_connection(conn: Connection, settings: &MemorySettings) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        Self {
            memory: MemoryStore::new(conn.clone(), settings),
            behavior: BehaviorStore::new(conn.clone()),
            learnings: LearningStore::new(conn.clone(), settings),
            metrics: MetricsStore::new(conn.clone()),
            snapshots: SnapshotStore::new(conn.clone()),
            niches: NicheStore::new(conn.clone(), settings),
            agents: AgentStore::new(conn.clone()),
            conversations: ConversationStore::new(conn.clone()),
            pruner: PruneEngine::new(conn),
        }
    }

    /// Route quota-soft events of the memory store to `tx`.
    pub fn with_prune_notifier(mut self, tx: UnboundedSender<AgentId>) -> Self {
        self.memory = self.memory.with_prune_notifier(tx);
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn behavior(&self) -> &BehaviorStore {
        &self.behavior
    }

    pub fn learnings(&self) -> &LearningStore {
        &self.learnings
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn niches(&self) -> &NicheStore {
        &self.niches
    }

    pub fn agents(&self) -> &AgentStore {
        &self.agents
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn pruner(&self) -> &PruneEngine {
        &self.pruner
    }

    /// Similarity search on a blocking thread.
    pub async fn search(
        &self,
        agent_id: AgentId,
        query: Vec<f32>,
        limit: usize,
        min_similarity: f32,
    ) -> SiccResult<Vec<ScoredChunk>> {
        let store = self.memory.clone();
        tokio::task::spawn_blocking(move || store.search(agent_id, &query, limit, min_similarity))
            .await
            .map_err(|e| SiccError::Internal(format!("spawn_blocking join failed: {e}")))?
    }

    /// Applicable patterns on a blocking thread.
    pub async fn get_applicable(
        &self,
        agent_id: AgentId,
        context: RuntimeContext,
    ) -> SiccResult<Vec<BehaviorPattern>> {
        let store = self.behavior.clone();
        tokio::task::spawn_blocking(move || store.get_applicable(agent_id, &context))
            .await
            .map_err(|e| SiccError::Internal(format!("spawn_blocking join failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::tests::unit;
    use sicc_types::memory::{ChunkType, NewMemoryChunk};

    #[tokio::test]
    async fn test_async_search_over_shared_connection() {
        let substrate = SiccSubstrate::open_in_memory(&MemorySettings::default()).unwrap();
        let agent = AgentId::new();
        substrate
            .memory()
            .create(NewMemoryChunk::new(agent, "c", "Horário 9h-18h", ChunkType::Faq, unit(0, 0.0)))
            .unwrap();
        let hits = substrate.search(agent, unit(0, 0.1), 5, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(substrate
            .get_applicable(agent, RuntimeContext::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sicc.db");
        let substrate = SiccSubstrate::open(&path, &MemorySettings::default()).unwrap();
        assert!(path.exists());
        assert_eq!(substrate.memory().count_active(AgentId::new()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_notifier_receives_agent() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let settings = MemorySettings {
            agent_memory_quota: 1,
            ..MemorySettings::default()
        };
        let substrate = SiccSubstrate::open_in_memory(&settings)
            .unwrap()
            .with_prune_notifier(tx);
        let agent = AgentId::new();
        for (i, content) in ["a", "b"].into_iter().enumerate() {
            substrate
                .memory()
                .create(NewMemoryChunk::new(agent, "c", content, ChunkType::Faq, unit(i, 0.0)))
                .unwrap();
        }
        assert_eq!(rx.recv().await, Some(agent));
    }
}
