//! Per-agent write serialization.

use dashmap::DashMap;
use sicc_types::agent::AgentId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per agent. Writes that span several rows of the same
/// agent (propagation, rollback, snapshot restore, approval) hold it;
/// different agents never wait on each other.
#[derive(Default)]
pub struct AgentLocks {
    locks: DashMap<AgentId, Arc<Mutex<()>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the agent's write lock.
    pub async fn lock(&self, agent_id: AgentId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the agent's entry (after the agent is deleted).
    pub fn forget(&self, agent_id: AgentId) {
        self.locks.remove(&agent_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
