//! Learning pipeline: transcript analysis, routing and human review.

use super::heuristics::{propose, KnownKnowledge, Proposal};
use crate::blocking::run_blocking;
use crate::locks::AgentLocks;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sicc_memory::learning::{Consolidation, DUPLICATE_NOTE};
use sicc_memory::session::ConversationStore;
use sicc_memory::SiccSubstrate;
use sicc_runtime::embedding_service::EmbeddingService;
use sicc_types::agent::AgentId;
use sicc_types::config::LearningSettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::learning::{
    AnalysisReport, Candidate, CandidateOutcome, LearningId, LearningLog, LearningStatus,
    ReviewFailure, ReviewResult, AUTO_REVIEWER,
};
use sicc_types::memory::{meta_keys, Layer, MemorySource, NewMemoryChunk};
use sicc_types::pattern::{NewBehaviorPattern, PatternFilter};
use sicc_types::transcript::Transcript;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Review note of candidates rejected by routing.
pub const LOW_CONFIDENCE_NOTE: &str = "low_confidence";

/// Metadata key linking a consolidated row back to its learning.
const LEARNING_ID_KEY: &str = "learning_id";

/// Upper bound on the patterns consulted when skipping known knowledge.
const KNOWN_PATTERN_LIMIT: usize = 10_000;

/// Where the pipeline reads conversations from. The pipeline never writes
/// through it.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// The agent's conversations started at or after `since`.
    async fn get_conversations(
        &self,
        agent_id: AgentId,
        since: DateTime<Utc>,
    ) -> SiccResult<Vec<Transcript>>;
}

#[async_trait]
impl TranscriptSource for ConversationStore {
    async fn get_conversations(
        &self,
        agent_id: AgentId,
        since: DateTime<Utc>,
    ) -> SiccResult<Vec<Transcript>> {
        let store = self.clone();
        run_blocking(move || store.get_conversations(agent_id, since)).await
    }
}

/// Turns an agent's conversations into reviewed, consolidated knowledge.
#[derive(Clone)]
pub struct LearningPipeline {
    substrate: SiccSubstrate,
    embeddings: Arc<EmbeddingService>,
    source: Arc<dyn TranscriptSource>,
    settings: LearningSettings,
    locks: Arc<AgentLocks>,
}

impl LearningPipeline {
    pub fn new(
        substrate: SiccSubstrate,
        embeddings: Arc<EmbeddingService>,
        source: Arc<dyn TranscriptSource>,
        settings: LearningSettings,
        locks: Arc<AgentLocks>,
    ) -> Self {
        Self {
            substrate,
            embeddings,
            source,
            settings,
            locks,
        }
    }

    pub fn settings(&self) -> &LearningSettings {
        &self.settings
    }

    /// Analyze the agent's conversations of the last `time_window_hours`.
    ///
    /// Conversations with fewer than `min_messages` messages are ignored.
    /// Every new candidate is recorded and routed by confidence: at or above
    /// the auto-approve threshold it is consolidated, below the review
    /// threshold it is rejected as `low_confidence`, and anything between
    /// stays `pending`. Candidates that are still open, were rejected by a
    /// reviewer, or were auto-rejected at no lower confidence are skipped.
    /// Cancellation is checked before each candidate; the ones already
    /// handled stay handled.
    pub async fn analyze_conversations(
        &self,
        agent_id: AgentId,
        time_window_hours: u32,
        min_messages: usize,
        cancel: &CancellationToken,
    ) -> SiccResult<AnalysisReport> {
        let mut report = AnalysisReport {
            agent_id,
            conversations_analyzed: 0,
            candidates: Vec::new(),
            cancelled: false,
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let since = Utc::now() - Duration::hours(i64::from(time_window_hours));
        let transcripts: Vec<Transcript> = self
            .source
            .get_conversations(agent_id, since)
            .await?
            .into_iter()
            .filter(|t| t.agent_id == agent_id && t.messages.len() >= min_messages)
            .collect();
        report.conversations_analyzed = transcripts.len();
        if transcripts.is_empty() {
            debug!(agent_id = %agent_id, "No conversations to analyze");
            return Ok(report);
        }

        let substrate = self.substrate.clone();
        let known = run_blocking(move || {
            let contents = substrate.memory().active_contents(agent_id)?;
            let names = substrate
                .behavior()
                .list_by_agent(agent_id, &PatternFilter::active(), KNOWN_PATTERN_LIMIT)?
                .into_iter()
                .map(|p| p.pattern_name);
            Ok(KnownKnowledge::new(contents, names))
        })
        .await?;

        for proposal in propose(&transcripts, &known, &self.settings) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Some(outcome) = self.route(agent_id, proposal).await {
                report.candidates.push(outcome);
            }
        }

        info!(
            agent_id = %agent_id,
            conversations = report.conversations_analyzed,
            candidates = report.candidates.len(),
            applied = report.count(LearningStatus::Applied),
            pending = report.count(LearningStatus::Pending),
            rejected = report.count(LearningStatus::Rejected),
            cancelled = report.cancelled,
            "Conversation analysis finished"
        );
        Ok(report)
    }

    /// Record one proposal and route it. `None` when an earlier learning
    /// with the same candidate already settles it.
    async fn route(&self, agent_id: AgentId, proposal: Proposal) -> Option<CandidateOutcome> {
        let mut outcome = CandidateOutcome {
            learning_id: None,
            learning_type: proposal.learning_type,
            detected_pattern: proposal.analysis.detected_pattern.clone(),
            confidence: proposal.confidence,
            status: None,
            error: None,
        };

        let substrate = self.substrate.clone();
        let key = proposal.candidate.dedupe_key();
        let confidence = proposal.confidence;
        let recorded = run_blocking(move || {
            if substrate
                .learnings()
                .find_existing(agent_id, &key, confidence)?
                .is_some()
            {
                return Ok(None);
            }
            substrate
                .learnings()
                .record(proposal.into_learning(agent_id))
                .map(Some)
        })
        .await;
        let log = match recorded {
            Ok(Some(log)) => log,
            Ok(None) => {
                debug!(agent_id = %agent_id, pattern = %outcome.detected_pattern, "Candidate already settled");
                return None;
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to record candidate learning");
                outcome.error = Some(e.to_string());
                return Some(outcome);
            }
        };
        outcome.learning_id = Some(log.id);
        outcome.status = Some(log.status);

        if log.confidence >= self.settings.auto_approve_threshold {
            match self.approve_learning(log.id, AUTO_REVIEWER).await {
                Ok(applied) => outcome.status = Some(applied.status),
                Err(SiccError::ReviewFailed(ReviewFailure::Duplicate)) => {
                    outcome.status = Some(LearningStatus::Rejected);
                    outcome.error = Some(DUPLICATE_NOTE.to_string());
                }
                Err(e) => {
                    warn!(learning_id = %log.id, error = %e, "Auto-approval failed, left pending");
                    outcome.error = Some(e.to_string());
                }
            }
        } else if log.confidence < self.settings.review_threshold {
            match self
                .reject_learning(log.id, AUTO_REVIEWER, LOW_CONFIDENCE_NOTE)
                .await
            {
                Ok(rejected) => outcome.status = Some(rejected.status),
                Err(e) => outcome.error = Some(e.to_string()),
            }
        }
        Some(outcome)
    }

    /// Approve a pending learning and consolidate it at the individual layer.
    ///
    /// Fails with `ReviewFailed(NotPending)` for a learning already reviewed,
    /// `ReviewFailed(Duplicate)` when the row would duplicate an active one
    /// (the learning is then rejected) and `ReviewFailed(Upstream)` when the
    /// content cannot be embedded.
    pub async fn approve_learning(&self, id: LearningId, reviewer: &str) -> SiccResult<LearningLog> {
        let log = self.get_learning(id).await?;
        if log.status != LearningStatus::Pending {
            return Err(SiccError::ReviewFailed(ReviewFailure::NotPending));
        }
        let agent_id = log.agent_id;
        let substrate = self.substrate.clone();
        let client_id = match run_blocking(move || substrate.agents().get(agent_id)).await {
            Ok(agent) => agent.client_id,
            Err(SiccError::NotFound { .. }) => agent_id.to_string(),
            Err(e) => return Err(e),
        };

        let consolidation = match &log.source_data.candidate {
            Candidate::Memory {
                content,
                chunk_type,
            } => {
                let embedding = self.embeddings.embed(content).await.map_err(|e| {
                    warn!(learning_id = %id, error = %e, "Embedding failed during approval");
                    SiccError::ReviewFailed(ReviewFailure::Upstream)
                })?;
                let mut chunk = NewMemoryChunk::new(agent_id, client_id, content.clone(), *chunk_type, embedding)
                    .with_layer(Layer::Individual)
                    .with_source(MemorySource::IsaAnalysis)
                    .with_confidence(log.confidence);
                chunk
                    .metadata
                    .insert(LEARNING_ID_KEY.to_string(), id.to_string().into());
                Consolidation::Memory(chunk)
            }
            Candidate::Pattern {
                pattern_name,
                pattern_type,
                trigger_context,
                action_config,
            } => {
                let mut pattern = NewBehaviorPattern::new(
                    agent_id,
                    client_id,
                    pattern_name.clone(),
                    *pattern_type,
                    trigger_context.clone(),
                    action_config.clone(),
                )
                .with_layer(Layer::Individual);
                pattern.metadata.insert(
                    meta_keys::SOURCE.to_string(),
                    MemorySource::IsaAnalysis.as_str().into(),
                );
                pattern
                    .metadata
                    .insert(LEARNING_ID_KEY.to_string(), id.to_string().into());
                Consolidation::Pattern(pattern)
            }
        };

        let _guard = self.locks.lock(agent_id).await;
        let substrate = self.substrate.clone();
        let reviewer_name = reviewer.to_string();
        let (applied, _) = run_blocking(move || {
            substrate
                .learnings()
                .approve_and_apply(id, &reviewer_name, consolidation)
        })
        .await?;
        Ok(applied)
    }

    /// Reject a pending learning with a reason.
    pub async fn reject_learning(
        &self,
        id: LearningId,
        reviewer: &str,
        reason: &str,
    ) -> SiccResult<LearningLog> {
        let substrate = self.substrate.clone();
        let reviewer = reviewer.to_string();
        let reason = reason.to_string();
        run_blocking(move || substrate.learnings().reject(id, &reviewer, &reason)).await
    }

    /// Approve each id in order, reporting per-item results.
    pub async fn batch_approve(&self, ids: &[LearningId], reviewer: &str) -> Vec<ReviewResult> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = self.approve_learning(id, reviewer).await;
            results.push(self.review_result(id, outcome).await);
        }
        results
    }

    /// Reject each id in order, reporting per-item results.
    pub async fn batch_reject(
        &self,
        ids: &[LearningId],
        reviewer: &str,
        reason: &str,
    ) -> Vec<ReviewResult> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = self.reject_learning(id, reviewer, reason).await;
            results.push(self.review_result(id, outcome).await);
        }
        results
    }

    async fn review_result(&self, id: LearningId, outcome: SiccResult<LearningLog>) -> ReviewResult {
        match outcome {
            Ok(log) => ReviewResult {
                id,
                success: true,
                status: Some(log.status),
                error: None,
            },
            Err(e) => {
                let failure = ReviewFailure::from(&e);
                let status = match failure {
                    ReviewFailure::NotFound => None,
                    _ => self.get_learning(id).await.ok().map(|l| l.status),
                };
                ReviewResult {
                    id,
                    success: false,
                    status,
                    error: Some(failure),
                }
            }
        }
    }

    pub async fn get_learning(&self, id: LearningId) -> SiccResult<LearningLog> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.learnings().get(id)).await
    }

    /// The agent's learnings, newest first.
    pub async fn list_learnings(
        &self,
        agent_id: AgentId,
        status: Option<LearningStatus>,
        limit: usize,
        offset: usize,
    ) -> SiccResult<Vec<LearningLog>> {
        let substrate = self.substrate.clone();
        run_blocking(move || substrate.learnings().list(agent_id, status, limit, offset)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sicc_types::config::{EmbeddingSettings, MemorySettings};
    use sicc_types::memory::{ChunkType, MemoryFilter};
    use sicc_types::transcript::{Role, TranscriptMessage};

    fn pipeline_with(settings: LearningSettings) -> (LearningPipeline, SiccSubstrate) {
        let substrate = SiccSubstrate::open_in_memory(&MemorySettings::default()).unwrap();
        let embeddings = Arc::new(EmbeddingService::load(&EmbeddingSettings::default()).unwrap());
        let source: Arc<dyn TranscriptSource> = Arc::new(substrate.conversations().clone());
        let pipeline = LearningPipeline::new(
            substrate.clone(),
            embeddings,
            source,
            settings,
            Arc::new(AgentLocks::new()),
        );
        (pipeline, substrate)
    }

    fn ingest_premium(substrate: &SiccSubstrate, agent: AgentId) {
        let conversations = [
            ("Quero saber sobre o plano premium", "O plano premium inclui suporte 24h."),
            ("Como contratar o plano premium", "Você pode assinar o plano premium pelo site."),
            ("Tem desconto no plano premium anual?", "Sim, 10% no pagamento anual."),
        ];
        for (i, (user, assistant)) in conversations.into_iter().enumerate() {
            substrate
                .conversations()
                .ingest(&Transcript {
                    id: format!("conv-{i}"),
                    agent_id: agent,
                    messages: vec![
                        TranscriptMessage::new(Role::User, user),
                        TranscriptMessage::new(Role::Assistant, assistant),
                    ],
                    satisfaction: None,
                    started_at: Utc::now(),
                })
                .unwrap();
        }
    }

    async fn analyze(pipeline: &LearningPipeline, agent: AgentId) -> AnalysisReport {
        pipeline
            .analyze_conversations(agent, 24, 2, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_term_candidate_pending_then_approved_once() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);

        let report = analyze(&pipeline, agent).await;
        assert_eq!(report.conversations_analyzed, 3);
        assert_eq!(report.candidates.len(), 1);
        let candidate = &report.candidates[0];
        assert_eq!(candidate.status, Some(LearningStatus::Pending));
        assert!(candidate.confidence >= 0.7);
        let id = candidate.learning_id.unwrap();

        let applied = pipeline.approve_learning(id, "ana").await.unwrap();
        assert_eq!(applied.status, LearningStatus::Applied);
        assert_eq!(applied.reviewed_by.as_deref(), Some("ana"));

        let chunks = substrate
            .memory()
            .list_by_agent(agent, &MemoryFilter::default(), 10)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, MemorySource::IsaAnalysis);
        assert_eq!(chunks[0].layer(), Layer::Individual);
        assert_eq!(chunks[0].chunk_type, ChunkType::BusinessTerm);

        let again = pipeline.approve_learning(id, "ana").await.unwrap_err();
        assert!(matches!(again, SiccError::ReviewFailed(ReviewFailure::NotPending)));

        // Known now, and already applied: a rerun proposes nothing.
        assert!(analyze(&pipeline, agent).await.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate_pending_candidates() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        assert_eq!(analyze(&pipeline, agent).await.candidates.len(), 1);
        assert!(analyze(&pipeline, agent).await.candidates.is_empty());
        let logs = pipeline.list_learnings(agent, None, 10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_high_confidence_is_applied_automatically() {
        let (pipeline, substrate) = pipeline_with(LearningSettings {
            auto_approve_threshold: 0.7,
            ..LearningSettings::default()
        });
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let report = analyze(&pipeline, agent).await;
        assert_eq!(report.count(LearningStatus::Applied), 1);
        let log = pipeline
            .get_learning(report.candidates[0].learning_id.unwrap())
            .await
            .unwrap();
        assert_eq!(log.reviewed_by.as_deref(), Some(AUTO_REVIEWER));
        assert_eq!(substrate.memory().count_active(agent).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_is_rejected() {
        let (pipeline, substrate) = pipeline_with(LearningSettings {
            auto_approve_threshold: 0.95,
            review_threshold: 0.9,
            ..LearningSettings::default()
        });
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let report = analyze(&pipeline, agent).await;
        assert_eq!(report.count(LearningStatus::Rejected), 1);
        let log = pipeline
            .get_learning(report.candidates[0].learning_id.unwrap())
            .await
            .unwrap();
        assert_eq!(log.review_note.as_deref(), Some(LOW_CONFIDENCE_NOTE));
    }

    #[tokio::test]
    async fn test_duplicate_content_rejects_on_approval() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let id = analyze(&pipeline, agent).await.candidates[0].learning_id.unwrap();

        let embedding = pipeline.embeddings.embed("Plano Premium").await.unwrap();
        substrate
            .memory()
            .create(NewMemoryChunk::new(agent, "c1", "Plano  Premium", ChunkType::Faq, embedding))
            .unwrap();

        let results = pipeline.batch_approve(&[id, LearningId::new()], "ana").await;
        assert_eq!(results[0].error, Some(ReviewFailure::Duplicate));
        assert_eq!(results[0].status, Some(LearningStatus::Rejected));
        assert_eq!(results[1].error, Some(ReviewFailure::NotFound));
        assert!(results.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn test_batch_reject_reports_per_item() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let id = analyze(&pipeline, agent).await.candidates[0].learning_id.unwrap();

        let results = pipeline.batch_reject(&[id, id], "ana", "off-topic").await;
        assert!(results[0].success);
        assert_eq!(results[0].status, Some(LearningStatus::Rejected));
        assert_eq!(results[1].error, Some(ReviewFailure::NotPending));
    }

    #[tokio::test]
    async fn test_cancelled_analysis_records_nothing() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline
            .analyze_conversations(agent, 24, 2, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.candidates.is_empty());
        assert!(pipeline.list_learnings(agent, None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_conversations_are_ignored() {
        let (pipeline, substrate) = pipeline_with(LearningSettings::default());
        let agent = AgentId::new();
        ingest_premium(&substrate, agent);
        let report = pipeline
            .analyze_conversations(agent, 24, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.conversations_analyzed, 0);
        assert!(report.candidates.is_empty());
    }
}
