//! Niche propagation engine.
//!
//! A niche version is a bundle of base-layer memories and patterns. Propagating
//! it writes the bundle into every target agent, one agent per transaction and
//! each behind a pre-propagation snapshot; rolling it back restores those
//! snapshots and removes whatever still carries the version id.

use crate::blocking::run_blocking;
use crate::locks::AgentLocks;
use sicc_memory::SiccSubstrate;
use sicc_runtime::embedding_service::EmbeddingService;
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::{MemorySource, NewMemoryChunk};
use sicc_types::niche::{
    AgentOpStatus, AgentPropagation, AgentRollback, BundleMemory, BundlePattern, NicheVersion,
    NicheVersionId, PropagationRecord, PropagationReport, RollbackReport,
};
use sicc_types::pattern::NewBehaviorPattern;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Creates, propagates and rolls back niche versions.
#[derive(Clone)]
pub struct PropagationEngine {
    substrate: SiccSubstrate,
    embeddings: Arc<EmbeddingService>,
    locks: Arc<AgentLocks>,
}

impl PropagationEngine {
    pub fn new(
        substrate: SiccSubstrate,
        embeddings: Arc<EmbeddingService>,
        locks: Arc<AgentLocks>,
    ) -> Self {
        Self {
            substrate,
            embeddings,
            locks,
        }
    }

    /// Store a new `draft` version.
    pub async fn create_version(
        &self,
        niche_type: String,
        version_name: Option<String>,
        memories: Vec<BundleMemory>,
        patterns: Vec<BundlePattern>,
    ) -> SiccResult<NicheVersion> {
        let substrate = self.substrate.clone();
        run_blocking(move || {
            substrate
                .niches()
                .create_version(&niche_type, version_name, memories, patterns)
        })
        .await
    }

    /// Versions of a niche (all niches when `None`), newest first.
    pub async fn list_versions(&self, niche_type: Option<String>) -> SiccResult<Vec<NicheVersion>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.niches().list_versions(niche_type.as_deref())).await
    }

    /// Per-agent propagation ledger of a version.
    pub async fn list_propagations(&self, version_id: NicheVersionId) -> SiccResult<Vec<PropagationRecord>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.niches().list_propagations(version_id)).await
    }

    /// Install the version into `targets`, or into every registered agent of
    /// the version's niche when `targets` is `None`.
    ///
    /// Each agent succeeds or fails on its own; a failed agent carries nothing
    /// of the version. `cancel` is checked between agents and agents not yet
    /// reached are reported `cancelled`.
    pub async fn propagate(
        &self,
        version_id: NicheVersionId,
        targets: Option<Vec<AgentId>>,
        create_snapshots: bool,
        cancel: &CancellationToken,
    ) -> SiccResult<PropagationReport> {
        let substrate = self.substrate.clone();
        let version = run_blocking(move || substrate.niches().get_version(version_id)).await?;
        let targets = match targets {
            Some(targets) => targets,
            None => {
                let substrate = self.substrate.clone();
                let niche = version.niche_type.clone();
                run_blocking(move || substrate.agents().list(Some(&niche)))
                    .await?
                    .into_iter()
                    .map(|a| a.agent_id)
                    .collect()
            }
        };

        let contents: Vec<&str> = version.memories.iter().map(|m| m.content.as_str()).collect();
        let embeddings = self.embeddings.embed_batch(&contents).await.map_err(SiccError::from)?;
        let bundle = Arc::new(PreparedBundle {
            version_id,
            memories: version.memories.iter().cloned().zip(embeddings).collect(),
            patterns: version.patterns.clone(),
        });

        info!(
            version_id = %version_id,
            niche = %version.niche_type,
            agents = targets.len(),
            "Propagating niche version"
        );
        let mut agents = Vec::with_capacity(targets.len());
        for agent_id in targets {
            if cancel.is_cancelled() {
                agents.push(AgentPropagation {
                    agent_id,
                    status: AgentOpStatus::Cancelled,
                    snapshot_id: None,
                    memories_inserted: 0,
                    patterns_inserted: 0,
                    skipped_duplicates: 0,
                    error: None,
                });
                continue;
            }
            let _guard = self.locks.lock(agent_id).await;
            let substrate = self.substrate.clone();
            let bundle = bundle.clone();
            let outcome = run_blocking(move || {
                let agent = substrate.agents().get(agent_id)?;
                let memories = bundle
                    .memories
                    .iter()
                    .map(|(m, embedding)| {
                        let mut chunk = NewMemoryChunk::new(
                            agent_id,
                            agent.client_id.clone(),
                            m.content.clone(),
                            m.chunk_type,
                            embedding.clone(),
                        )
                        .with_source(MemorySource::Manual);
                        chunk.metadata = m.metadata.clone();
                        chunk.with_version(bundle.version_id.to_string())
                    })
                    .collect();
                let patterns = bundle
                    .patterns
                    .iter()
                    .map(|p| {
                        NewBehaviorPattern::new(
                            agent_id,
                            agent.client_id.clone(),
                            p.pattern_name.clone(),
                            p.pattern_type,
                            p.trigger_context.clone(),
                            p.action_config.clone(),
                        )
                        .with_version(bundle.version_id.to_string())
                    })
                    .collect();
                substrate.niches().apply_propagation(
                    bundle.version_id,
                    &agent,
                    memories,
                    patterns,
                    create_snapshots,
                )
            })
            .await;
            agents.push(outcome.unwrap_or_else(|e| {
                warn!(version_id = %version_id, agent_id = %agent_id, error = %e, "Propagation failed for agent");
                AgentPropagation {
                    agent_id,
                    status: AgentOpStatus::Error,
                    snapshot_id: None,
                    memories_inserted: 0,
                    patterns_inserted: 0,
                    skipped_duplicates: 0,
                    error: Some(e.to_string()),
                }
            }));
        }

        let report = PropagationReport { version_id, agents };
        info!(
            version_id = %version_id,
            succeeded = report.count(AgentOpStatus::Success),
            failed = report.count(AgentOpStatus::Error),
            cancelled = report.count(AgentOpStatus::Cancelled),
            "Propagation finished"
        );
        Ok(report)
    }

    /// Remove the version from `targets`, or from every agent carrying it.
    /// Agents that do not carry the version are left alone, so a second
    /// rollback reports nothing.
    pub async fn rollback(
        &self,
        version_id: NicheVersionId,
        targets: Option<Vec<AgentId>>,
    ) -> SiccResult<RollbackReport> {
        let substrate = self.substrate.clone();
        let carrying = run_blocking(move || {
            substrate.niches().get_version(version_id)?;
            substrate.niches().open_agents(version_id)
        })
        .await?;
        let targets: Vec<AgentId> = match targets {
            Some(targets) => targets.into_iter().filter(|a| carrying.contains(a)).collect(),
            None => carrying,
        };

        let mut agents = Vec::with_capacity(targets.len());
        for agent_id in targets {
            let _guard = self.locks.lock(agent_id).await;
            let substrate = self.substrate.clone();
            match run_blocking(move || substrate.niches().apply_rollback(version_id, agent_id)).await {
                Ok(Some(rollback)) => agents.push(rollback),
                Ok(None) => {}
                Err(e) => {
                    warn!(version_id = %version_id, agent_id = %agent_id, error = %e, "Rollback failed for agent");
                    agents.push(AgentRollback {
                        agent_id,
                        status: AgentOpStatus::Error,
                        restored_snapshot: false,
                        rows_deleted: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        info!(version_id = %version_id, agents = agents.len(), "Rollback finished");
        Ok(RollbackReport { version_id, agents })
    }

    /// Delete a version that no agent carries any more.
    pub async fn delete_version(&self, version_id: NicheVersionId) -> SiccResult<()> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.niches().delete_version(version_id)).await
    }
}

/// A version's bundle with its memories already embedded.
struct PreparedBundle {
    version_id: NicheVersionId,
    memories: Vec<(BundleMemory, Vec<f32>)>,
    patterns: Vec<BundlePattern>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sicc_types::config::{EmbeddingSettings, MemorySettings};
    use sicc_types::memory::{ChunkType, MemoryFilter};
    use sicc_types::niche::NicheVersionStatus;
    use sicc_types::pattern::{PatternFilter, PatternType, TriggerContext};

    fn engine() -> (PropagationEngine, SiccSubstrate) {
        let substrate = SiccSubstrate::open_in_memory(&MemorySettings::default()).unwrap();
        let embeddings = Arc::new(EmbeddingService::load(&EmbeddingSettings::default()).unwrap());
        let engine = PropagationEngine::new(substrate.clone(), embeddings, Arc::new(AgentLocks::new()));
        (engine, substrate)
    }

    fn register(substrate: &SiccSubstrate, niche: &str) -> AgentId {
        let agent = AgentId::new();
        substrate
            .agents()
            .register(agent, "c1", Some(niche.into()), None)
            .unwrap();
        agent
    }

    async fn clinic_version(engine: &PropagationEngine) -> NicheVersion {
        engine
            .create_version(
                "clinica".into(),
                None,
                vec![
                    BundleMemory {
                        content: "Consultas duram 30 minutos".into(),
                        chunk_type: ChunkType::Process,
                        metadata: Default::default(),
                    },
                    BundleMemory {
                        content: "Aceitamos convênios".into(),
                        chunk_type: ChunkType::Faq,
                        metadata: Default::default(),
                    },
                ],
                vec![BundlePattern {
                    pattern_name: "confirm_appointment".into(),
                    pattern_type: PatternType::FlowOptimization,
                    trigger_context: TriggerContext::new(),
                    action_config: json!({"steps": ["date", "time", "confirm"]}),
                }],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_propagate_defaults_to_niche_agents() {
        let (engine, substrate) = engine();
        let a = register(&substrate, "clinica");
        let b = register(&substrate, "clinica");
        let outsider = register(&substrate, "mmn");
        let version = clinic_version(&engine).await;

        let report = engine
            .propagate(version.id, None, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.count(AgentOpStatus::Success), 2);
        for agent in [a, b] {
            let rows = substrate
                .memory()
                .list_by_agent(agent, &MemoryFilter::active(), 10)
                .unwrap();
            assert_eq!(rows.len(), 2);
            assert!(rows.iter().all(|m| m.version_id() == Some(version.id.to_string().as_str())));
        }
        assert_eq!(substrate.memory().count_active(outsider).unwrap(), 0);
        let stored = substrate.niches().get_version(version.id).unwrap();
        assert_eq!(stored.status, NicheVersionStatus::Active);
    }

    #[tokio::test]
    async fn test_unregistered_agent_reports_error() {
        let (engine, substrate) = engine();
        let a = register(&substrate, "clinica");
        let stranger = AgentId::new();
        let version = clinic_version(&engine).await;

        let report = engine
            .propagate(version.id, Some(vec![stranger, a]), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.agents[0].status, AgentOpStatus::Error);
        assert!(report.agents[0].error.is_some());
        assert_eq!(report.agents[1].status, AgentOpStatus::Success);
        assert_eq!(substrate.memory().count_active(stranger).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let (engine, substrate) = engine();
        let a = register(&substrate, "clinica");
        let version = clinic_version(&engine).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.propagate(version.id, None, true, &cancel).await.unwrap();
        assert_eq!(report.count(AgentOpStatus::Cancelled), 1);
        assert_eq!(substrate.memory().count_active(a).unwrap(), 0);
        assert!(substrate.snapshots().list_snapshots(a).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_propagate_and_rollback_are_idempotent() {
        let (engine, substrate) = engine();
        let a = register(&substrate, "clinica");
        let version = clinic_version(&engine).await;
        let cancel = CancellationToken::new();

        engine.propagate(version.id, Some(vec![a]), true, &cancel).await.unwrap();
        let again = engine.propagate(version.id, Some(vec![a]), true, &cancel).await.unwrap();
        assert_eq!(again.agents[0].memories_inserted, 0);
        assert_eq!(again.agents[0].skipped_duplicates, 3);
        assert_eq!(substrate.memory().count_active(a).unwrap(), 2);

        let first = engine.rollback(version.id, Some(vec![a])).await.unwrap();
        assert_eq!(first.agents.len(), 1);
        assert!(first.agents[0].restored_snapshot);
        let second = engine.rollback(version.id, Some(vec![a])).await.unwrap();
        assert!(second.agents.is_empty());

        assert_eq!(substrate.memory().count_active(a).unwrap(), 0);
        let patterns = substrate
            .behavior()
            .list_by_agent(a, &PatternFilter::active(), 10)
            .unwrap();
        assert!(patterns.is_empty());
        let stored = substrate.niches().get_version(version.id).unwrap();
        assert_eq!(stored.status, NicheVersionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_unknown_version_is_not_found() {
        let (engine, _) = engine();
        let err = engine
            .propagate(NicheVersionId::new(), None, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
