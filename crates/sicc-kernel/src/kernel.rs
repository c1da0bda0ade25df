//! SiccKernel: assembles the stores, the embedding service and the engines,
//! and exposes every operation the HTTP shell and the CLI need.

use crate::background;
use crate::blocking::run_blocking;
use crate::error::{KernelError, KernelResult};
use crate::learning::{LearningPipeline, TranscriptSource};
use crate::locks::AgentLocks;
use crate::orchestrator::Orchestrator;
use crate::propagation::PropagationEngine;
use chrono::NaiveDate;
use sicc_memory::SiccSubstrate;
use sicc_runtime::embedding_service::{self, EmbeddingService};
use sicc_types::agent::{AgentId, AgentRecord};
use sicc_types::config::SiccConfig;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::learning::{AnalysisReport, LearningId, LearningLog, LearningStatus, ReviewResult};
use sicc_types::memory::{ChunkType, MemoryId, Metadata, NewMemoryChunk};
use sicc_types::metrics::{AggregatedMetrics, DailyMetrics};
use sicc_types::niche::{
    BundleMemory, BundlePattern, NicheVersion, NicheVersionId, PropagationRecord,
    PropagationReport, RollbackReport,
};
use sicc_types::prompt::{EnrichRequest, EnrichedPrompt, OutcomeRecord, OutcomeReport};
use sicc_types::snapshot::{RestoreReport, Snapshot, SnapshotId};
use sicc_types::transcript::Transcript;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The SICC core.
pub struct SiccKernel {
    /// Effective configuration.
    pub config: SiccConfig,
    /// Durable stores.
    pub substrate: SiccSubstrate,
    /// Embedding service.
    pub embeddings: Arc<EmbeddingService>,
    /// Prompt enrichment.
    pub orchestrator: Orchestrator,
    /// Niche version propagation.
    pub propagation: PropagationEngine,
    /// Transcript analysis and review.
    pub learning: LearningPipeline,
    locks: Arc<AgentLocks>,
    shutdown: CancellationToken,
    prune_rx: Mutex<Option<UnboundedReceiver<AgentId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SiccKernel {
    /// Boot against the configured database file and the process-wide
    /// embedding service.
    pub async fn boot(config: SiccConfig) -> KernelResult<Self> {
        let path = config.database_path();
        let substrate = SiccSubstrate::open(&path, &config.memory)
            .map_err(|e| KernelError::BootFailed(format!("database {}: {e}", path.display())))?;
        let embeddings = embedding_service::global(&config.embedding).await?;
        info!(
            database = %path.display(),
            model = embeddings.model(),
            "SICC kernel booted"
        );
        Ok(Self::assemble(config, substrate, embeddings))
    }

    /// Boot against a fresh in-memory database with a private embedding
    /// service.
    pub fn boot_in_memory(config: SiccConfig) -> KernelResult<Self> {
        let substrate = SiccSubstrate::open_in_memory(&config.memory)?;
        let embeddings = Arc::new(EmbeddingService::load(&config.embedding)?);
        Ok(Self::assemble(config, substrate, embeddings))
    }

    fn assemble(config: SiccConfig, substrate: SiccSubstrate, embeddings: Arc<EmbeddingService>) -> Self {
        let (prune_tx, prune_rx) = tokio::sync::mpsc::unbounded_channel();
        let substrate = substrate.with_prune_notifier(prune_tx);
        let locks = Arc::new(AgentLocks::new());
        let source: Arc<dyn TranscriptSource> = Arc::new(substrate.conversations().clone());
        Self {
            orchestrator: Orchestrator::new(
                substrate.clone(),
                embeddings.clone(),
                config.orchestrator.clone(),
            ),
            propagation: PropagationEngine::new(substrate.clone(), embeddings.clone(), locks.clone()),
            learning: LearningPipeline::new(
                substrate.clone(),
                embeddings.clone(),
                source,
                config.learning.clone(),
                locks.clone(),
            ),
            config,
            substrate,
            embeddings,
            locks,
            shutdown: CancellationToken::new(),
            prune_rx: Mutex::new(Some(prune_rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the quota prune worker and the scheduled analysis worker.
    /// Calling it twice starts nothing new.
    pub fn start_background(&self) {
        let Some(rx) = self.prune_rx.lock().ok().and_then(|mut slot| slot.take()) else {
            warn!("Background workers already started");
            return;
        };
        let mut handles = vec![background::spawn_prune_worker(
            self.substrate.clone(),
            self.locks.clone(),
            rx,
            self.config.memory.agent_memory_quota,
            self.shutdown.child_token(),
        )];
        handles.extend(background::spawn_analysis_worker(
            self.substrate.clone(),
            self.learning.clone(),
            Duration::from_secs(self.config.learning.schedule_interval_secs),
            self.shutdown.child_token(),
        ));
        if let Ok(mut workers) = self.workers.lock() {
            workers.extend(handles);
        }
    }

    /// Cancel long-running work and wait for the background workers.
    pub async fn shutdown(&self) {
        info!("SICC kernel shutting down");
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }
    }

    /// Token cancelled on shutdown; long operations take a child of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // -- Agents ----------------------------------------------------------

    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        client_id: String,
        niche_type: Option<String>,
        company_id: Option<String>,
    ) -> SiccResult<AgentRecord> {
        let substrate = self.substrate.clone();
        run_blocking(move || {
            substrate
                .agents()
                .register(agent_id, &client_id, niche_type, company_id)
        })
        .await
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> SiccResult<AgentRecord> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.agents().get(agent_id)).await
    }

    pub async fn list_agents(&self, niche_type: Option<String>) -> SiccResult<Vec<AgentRecord>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.agents().list(niche_type.as_deref())).await
    }

    /// Remove an agent and everything it owns.
    pub async fn delete_agent(&self, agent_id: AgentId) -> SiccResult<()> {
        {
            let _guard = self.locks.lock(agent_id).await;
            let substrate = self.substrate.clone();
            run_blocking(move || substrate.agents().delete_agent(agent_id)).await?;
        }
        self.locks.forget(agent_id);
        Ok(())
    }

    // -- Memories --------------------------------------------------------

    /// Embed and store an operator-supplied memory, at the company layer
    /// when `company_id` is given and the individual layer otherwise.
    pub async fn add_memory(
        &self,
        agent_id: AgentId,
        content: String,
        chunk_type: ChunkType,
        company_id: Option<String>,
    ) -> SiccResult<MemoryId> {
        let client_id = match self.get_agent(agent_id).await {
            Ok(agent) => agent.client_id,
            Err(SiccError::NotFound { .. }) => agent_id.to_string(),
            Err(e) => return Err(e),
        };
        let embedding = self.embeddings.embed(&content).await?;
        let mut chunk = NewMemoryChunk::new(agent_id, client_id, content, chunk_type, embedding);
        if let Some(company) = company_id {
            chunk = chunk.with_company(company);
        }
        let _guard = self.locks.lock(agent_id).await;
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.memory().create(chunk)).await
    }

    // -- Enrichment ------------------------------------------------------

    pub async fn enrich_prompt(&self, agent_id: AgentId, request: EnrichRequest) -> EnrichedPrompt {
        self.orchestrator.enrich_prompt(agent_id, request).await
    }

    pub async fn record_outcome(
        &self,
        agent_id: AgentId,
        outcome: OutcomeRecord,
    ) -> SiccResult<OutcomeReport> {
        self.orchestrator.record_outcome(agent_id, outcome).await
    }

    // -- Learning --------------------------------------------------------

    pub async fn ingest_conversation(&self, transcript: Transcript) -> SiccResult<()> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.conversations().ingest(&transcript)).await
    }

    /// Analyze recent conversations; window and minimum length default to
    /// the configured values.
    pub async fn analyze_conversations(
        &self,
        agent_id: AgentId,
        time_window_hours: Option<u32>,
        min_messages: Option<usize>,
    ) -> SiccResult<AnalysisReport> {
        let settings = self.learning.settings();
        let cancel = self.shutdown.child_token();
        self.learning
            .analyze_conversations(
                agent_id,
                time_window_hours.unwrap_or(settings.time_window_hours),
                min_messages.unwrap_or(settings.min_messages),
                &cancel,
            )
            .await
    }

    pub async fn list_learnings(
        &self,
        agent_id: AgentId,
        status: Option<LearningStatus>,
        limit: usize,
        offset: usize,
    ) -> SiccResult<Vec<LearningLog>> {
        self.learning.list_learnings(agent_id, status, limit, offset).await
    }

    pub async fn get_learning(&self, id: LearningId) -> SiccResult<LearningLog> {
        self.learning.get_learning(id).await
    }

    pub async fn approve_learning(&self, id: LearningId, reviewer: &str) -> SiccResult<LearningLog> {
        self.learning.approve_learning(id, reviewer).await
    }

    pub async fn reject_learning(
        &self,
        id: LearningId,
        reviewer: &str,
        reason: &str,
    ) -> SiccResult<LearningLog> {
        self.learning.reject_learning(id, reviewer, reason).await
    }

    pub async fn batch_approve(&self, ids: &[LearningId], reviewer: &str) -> Vec<ReviewResult> {
        self.learning.batch_approve(ids, reviewer).await
    }

    pub async fn batch_reject(
        &self,
        ids: &[LearningId],
        reviewer: &str,
        reason: &str,
    ) -> Vec<ReviewResult> {
        self.learning.batch_reject(ids, reviewer, reason).await
    }

    // -- Metrics ---------------------------------------------------------

    pub async fn metrics(
        &self,
        agent_id: AgentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SiccResult<AggregatedMetrics> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.metrics().get_aggregated(agent_id, from, to)).await
    }

    pub async fn daily_metrics(
        &self,
        agent_id: AgentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SiccResult<Vec<DailyMetrics>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.metrics().list_range(agent_id, from, to)).await
    }

    pub async fn learning_velocity(&self, agent_id: AgentId, window_days: u32) -> SiccResult<f64> {
        let substrate = self.substrate.clone();
        run_blocking(move || {
            substrate
                .metrics()
                .calculate_learning_velocity(agent_id, window_days)
        })
        .await
    }

    // -- Niche versions --------------------------------------------------

    pub async fn create_niche_version(
        &self,
        niche_type: String,
        version_name: Option<String>,
        memories: Vec<BundleMemory>,
        patterns: Vec<BundlePattern>,
    ) -> SiccResult<NicheVersion> {
        self.propagation
            .create_version(niche_type, version_name, memories, patterns)
            .await
    }

    pub async fn get_niche_version(&self, id: NicheVersionId) -> SiccResult<NicheVersion> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.niches().get_version(id)).await
    }

    pub async fn list_niche_versions(&self, niche_type: Option<String>) -> SiccResult<Vec<NicheVersion>> {
        self.propagation.list_versions(niche_type).await
    }

    pub async fn delete_niche_version(&self, id: NicheVersionId) -> SiccResult<()> {
        self.propagation.delete_version(id).await
    }

    pub async fn list_propagations(&self, id: NicheVersionId) -> SiccResult<Vec<PropagationRecord>> {
        self.propagation.list_propagations(id).await
    }

    pub async fn propagate(
        &self,
        version_id: NicheVersionId,
        targets: Option<Vec<AgentId>>,
        create_snapshots: bool,
    ) -> SiccResult<PropagationReport> {
        let cancel = self.shutdown.child_token();
        self.propagation
            .propagate(version_id, targets, create_snapshots, &cancel)
            .await
    }

    pub async fn rollback(
        &self,
        version_id: NicheVersionId,
        targets: Option<Vec<AgentId>>,
    ) -> SiccResult<RollbackReport> {
        self.propagation.rollback(version_id, targets).await
    }

    // -- Snapshots -------------------------------------------------------

    pub async fn create_snapshot(
        &self,
        agent_id: AgentId,
        name: String,
        metadata: Metadata,
    ) -> SiccResult<Snapshot> {
        let _guard = self.locks.lock(agent_id).await;
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.snapshots().create_snapshot(agent_id, &name, metadata)).await
    }

    pub async fn list_snapshots(&self, agent_id: AgentId) -> SiccResult<Vec<Snapshot>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.snapshots().list_snapshots(agent_id)).await
    }

    /// Restore a snapshot while holding its agent's write lock.
    pub async fn restore_snapshot(&self, id: SnapshotId) -> SiccResult<RestoreReport> {
        let substrate = self.substrate.clone();
        let (snapshot, _) = run_blocking(move || substrate.snapshots().get_snapshot(id)).await?;
        let _guard = self.locks.lock(snapshot.agent_id).await;
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.snapshots().restore_snapshot(id)).await
    }

    pub async fn delete_snapshot(&self, id: SnapshotId) -> SiccResult<()> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.snapshots().delete_snapshot(id)).await
    }
}
