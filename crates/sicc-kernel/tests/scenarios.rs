//! End-to-end scenarios through the kernel facade.

use chrono::{Duration, Utc};
use serde_json::json;
use sicc_kernel::SiccKernel;
use sicc_memory::metrics::today;
use sicc_types::agent::AgentId;
use sicc_types::config::SiccConfig;
use sicc_types::error::SiccError;
use sicc_types::learning::{
    Analysis, Candidate, LearningStatus, LearningType, NewLearning, ReviewFailure, SourceData,
};
use sicc_types::memory::{ChunkType, Layer, MemoryFilter, MemorySource};
use sicc_types::metrics::InteractionRecord;
use sicc_types::niche::{AgentOpStatus, BundleMemory, BundlePattern, NicheVersionStatus};
use sicc_types::pattern::{NewBehaviorPattern, PatternFilter, PatternType, RuntimeContext, TriggerContext};
use sicc_types::prompt::EnrichRequest;
use sicc_types::transcript::{Role, Transcript, TranscriptMessage};
use std::collections::BTreeSet;

fn kernel() -> SiccKernel {
    SiccKernel::boot_in_memory(SiccConfig::default()).unwrap()
}

async fn registered(kernel: &SiccKernel, niche: Option<&str>) -> AgentId {
    let agent = AgentId::new();
    kernel
        .register_agent(agent, "client-1".into(), niche.map(str::to_string), None)
        .await
        .unwrap();
    agent
}

fn context(pairs: serde_json::Value) -> RuntimeContext {
    serde_json::from_value(pairs).unwrap()
}

#[tokio::test]
async fn enrichment_surfaces_relevant_memory() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    let mut ids = Vec::new();
    for content in [
        "What is SICC? It is a learning loop.",
        "How do I approve? Use the review page.",
        "Preço do plano Pro",
    ] {
        ids.push(
            kernel
                .add_memory(agent, content.into(), ChunkType::Faq, None)
                .await
                .unwrap(),
        );
    }

    let enriched = kernel
        .enrich_prompt(
            agent,
            EnrichRequest {
                message: "Explain SICC".into(),
                context: RuntimeContext::new(),
                base_prompt: Some("You are a helpful assistant.".into()),
            },
        )
        .await;

    assert!(enriched.memories_used.iter().any(|m| m.id == ids[0]));
    assert!(enriched.enriched_prompt.starts_with("You are a helpful assistant."));
    assert!(enriched.enriched_prompt.contains("learning loop"));
    assert!(enriched.enriched_prompt.ends_with("Explain SICC"));
    assert!(enriched.token_count <= 8000);
}

#[tokio::test]
async fn patterns_apply_by_trigger_and_count_outcomes() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    let mut trigger = TriggerContext::new();
    trigger.insert("message_type".into(), json!("greeting"));
    let id = kernel
        .substrate
        .behavior()
        .create(
            NewBehaviorPattern::new(
                agent,
                "client-1",
                "greet",
                PatternType::ResponseStrategy,
                trigger,
                json!({ "template": "Hi!" }),
            )
            .with_history(10, 9),
        )
        .unwrap();

    let greeting = kernel
        .substrate
        .get_applicable(agent, context(json!({ "message_type": "greeting" })))
        .await
        .unwrap();
    assert!(greeting.iter().any(|p| p.id == id));
    let question = kernel
        .substrate
        .get_applicable(agent, context(json!({ "message_type": "question" })))
        .await
        .unwrap();
    assert!(question.iter().all(|p| p.id != id));

    let updated = kernel.substrate.behavior().record_application(id, true).unwrap();
    assert_eq!(updated.total_applications, 11);
    assert_eq!(updated.successful_applications, 10);
}

#[tokio::test]
async fn snapshot_restore_brings_back_usage_counts() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    let first = kernel
        .add_memory(agent, "Atendemos das 9h às 18h".into(), ChunkType::Process, None)
        .await
        .unwrap();
    kernel
        .add_memory(agent, "Aceitamos Pix e cartão".into(), ChunkType::Faq, None)
        .await
        .unwrap();
    kernel.substrate.memory().increment_usage(first).unwrap();
    kernel.substrate.memory().increment_usage(first).unwrap();

    let active = |k: &SiccKernel| -> BTreeSet<(String, u64)> {
        k.substrate
            .memory()
            .list_by_agent(agent, &MemoryFilter::active(), 100)
            .unwrap()
            .into_iter()
            .map(|m| (m.id.to_string(), m.usage_count))
            .collect()
    };
    let before = active(&kernel);
    let snapshot = kernel
        .create_snapshot(agent, "before-cleanup".into(), Default::default())
        .await
        .unwrap();

    for chunk in kernel
        .substrate
        .memory()
        .list_by_agent(agent, &MemoryFilter::default(), 100)
        .unwrap()
    {
        kernel.substrate.memory().delete(chunk.id).unwrap();
    }
    assert!(active(&kernel).is_empty());

    kernel.restore_snapshot(snapshot.id).await.unwrap();
    assert_eq!(active(&kernel), before);
    assert!(before.iter().any(|(_, usage)| *usage == 2));
}

#[tokio::test]
async fn niche_version_propagates_and_rolls_back() {
    let kernel = kernel();
    let a = registered(&kernel, Some("clinica")).await;
    let b = registered(&kernel, Some("clinica")).await;
    kernel
        .add_memory(a, "Dra. Ana atende às terças".into(), ChunkType::Process, None)
        .await
        .unwrap();

    let version = kernel
        .create_niche_version(
            "clinica".into(),
            Some("v1".into()),
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
                pattern_name: "triagem".into(),
                pattern_type: PatternType::FlowOptimization,
                trigger_context: TriggerContext::new(),
                action_config: json!({ "steps": ["sintomas", "convênio", "agenda"] }),
            }],
        )
        .await
        .unwrap();

    let report = kernel.propagate(version.id, None, true).await.unwrap();
    assert_eq!(report.agents.len(), 2);
    assert!(report.agents.iter().all(|r| r.status == AgentOpStatus::Success));

    let version_tag = version.id.to_string();
    let carried = |k: &SiccKernel, agent: AgentId| -> (usize, usize) {
        let memories = k
            .substrate
            .memory()
            .list_by_agent(agent, &MemoryFilter::active(), 100)
            .unwrap()
            .into_iter()
            .filter(|m| m.layer() == Layer::Base && m.version_id() == Some(version_tag.as_str()))
            .count();
        let patterns = k
            .substrate
            .behavior()
            .list_by_agent(agent, &PatternFilter::active(), 100)
            .unwrap()
            .into_iter()
            .filter(|p| p.layer() == Layer::Base && p.version_id() == Some(version_tag.as_str()))
            .count();
        (memories, patterns)
    };
    assert_eq!(carried(&kernel, a), (2, 1));
    assert_eq!(carried(&kernel, b), (2, 1));

    let rollback = kernel.rollback(version.id, None).await.unwrap();
    assert_eq!(rollback.agents.len(), 2);
    assert!(rollback.agents.iter().all(|r| r.restored_snapshot));
    assert_eq!(carried(&kernel, a), (0, 0));
    assert_eq!(carried(&kernel, b), (0, 0));
    assert_eq!(kernel.substrate.memory().count_active(a).unwrap(), 1);

    let version = kernel.get_niche_version(version.id).await.unwrap();
    assert_eq!(version.status, NicheVersionStatus::RolledBack);
    assert!(kernel.rollback(version.id, None).await.unwrap().agents.is_empty());
}

#[tokio::test]
async fn analysis_proposes_business_term_once() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    let conversations = [
        ("Quero saber sobre o plano premium", "O plano premium inclui suporte 24h."),
        ("Como contratar o plano premium", "Você pode assinar o plano premium pelo site."),
        ("Tem desconto no plano premium anual?", "Sim, 10% no pagamento anual."),
    ];
    for (i, (user, assistant)) in conversations.into_iter().enumerate() {
        kernel
            .ingest_conversation(Transcript {
                id: format!("premium-{i}"),
                agent_id: agent,
                messages: vec![
                    TranscriptMessage::new(Role::User, user),
                    TranscriptMessage::new(Role::Assistant, assistant),
                ],
                satisfaction: None,
                started_at: Utc::now() - Duration::minutes(10 - i as i64),
            })
            .await
            .unwrap();
    }

    let report = kernel.analyze_conversations(agent, None, None).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
    let candidate = &report.candidates[0];
    assert_eq!(candidate.learning_type, LearningType::MemoryAdded);
    assert!(candidate.confidence >= 0.7);
    let id = candidate.learning_id.unwrap();
    let log = kernel.get_learning(id).await.unwrap();
    assert!(matches!(
        log.source_data.candidate,
        Candidate::Memory { chunk_type: ChunkType::BusinessTerm, .. }
    ));

    kernel.approve_learning(id, "reviewer").await.unwrap();
    let chunks = kernel
        .substrate
        .memory()
        .list_by_agent(agent, &MemoryFilter::active(), 10)
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].layer(), Layer::Individual);
    assert_eq!(chunks[0].source, MemorySource::IsaAnalysis);

    let err = kernel.approve_learning(id, "reviewer").await.unwrap_err();
    assert!(matches!(err, SiccError::ReviewFailed(ReviewFailure::NotPending)));
}

#[tokio::test]
async fn metrics_aggregate_and_velocity() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    let day = today();
    let metrics = kernel.substrate.metrics();
    for succeeded in [true, true, true, true, true, false, false] {
        metrics
            .record_interaction_on(
                agent,
                day,
                &InteractionRecord {
                    succeeded,
                    response_time_ms: 120,
                    satisfaction: None,
                },
            )
            .unwrap();
    }
    let aggregated = kernel.metrics(agent, day, day).await.unwrap();
    assert_eq!(aggregated.total_interactions, 7);
    assert_eq!(aggregated.successful_interactions, 5);

    for term in ["boleto", "pix", "cartão"] {
        let log = kernel
            .substrate
            .learnings()
            .record(NewLearning {
                agent_id: agent,
                learning_type: LearningType::MemoryAdded,
                source_data: SourceData {
                    excerpt: term.into(),
                    candidate: Candidate::Memory {
                        content: format!("Aceitamos {term}"),
                        chunk_type: ChunkType::BusinessTerm,
                    },
                    occurrences: 3,
                    conversations: 2,
                },
                analysis: Analysis::default(),
                confidence: 0.6,
            })
            .unwrap();
        assert_eq!(log.status, LearningStatus::Pending);
        kernel.approve_learning(log.id, "reviewer").await.unwrap();
    }

    let earlier = day - Duration::days(3);
    metrics
        .record_interaction_on(
            agent,
            earlier,
            &InteractionRecord {
                succeeded: true,
                response_time_ms: 80,
                satisfaction: Some(5.0),
            },
        )
        .unwrap();

    let velocity = kernel.learning_velocity(agent, 7).await.unwrap();
    assert!((velocity - 1.5).abs() < 1e-9, "velocity {velocity}");
    let empty = kernel.learning_velocity(AgentId::new(), 7).await.unwrap();
    assert_eq!(empty, 0.0);
}

async fn ingest(kernel: &SiccKernel, agent: AgentId, prefix: &str, turns: &[(&str, &str)]) {
    for (i, (user, assistant)) in turns.iter().enumerate() {
        kernel
            .ingest_conversation(Transcript {
                id: format!("{prefix}-{i}"),
                agent_id: agent,
                messages: vec![
                    TranscriptMessage::new(Role::User, *user),
                    TranscriptMessage::new(Role::Assistant, *assistant),
                ],
                satisfaction: None,
                started_at: Utc::now() - Duration::minutes(10 - i as i64),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn reviewer_rejection_survives_reanalysis() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    ingest(
        &kernel,
        agent,
        "premium",
        &[
            ("Quero saber sobre o plano premium", "O plano premium inclui suporte 24h."),
            ("Como contratar o plano premium", "Você pode assinar o plano premium pelo site."),
            ("Tem desconto no plano premium anual?", "Sim, 10% no pagamento anual."),
        ],
    )
    .await;

    let first = kernel.analyze_conversations(agent, None, None).await.unwrap();
    assert_eq!(first.candidates.len(), 1);
    let id = first.candidates[0].learning_id.unwrap();
    kernel.reject_learning(id, "human", "not a product term").await.unwrap();

    for _ in 0..2 {
        let rerun = kernel.analyze_conversations(agent, None, None).await.unwrap();
        assert!(rerun.candidates.is_empty());
    }
    let logs = kernel.list_learnings(agent, None, 10, 0).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LearningStatus::Rejected);
    assert!(kernel
        .list_learnings(agent, Some(LearningStatus::Pending), 10, 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn weak_evidence_is_rejected_once() {
    let kernel = kernel();
    let agent = registered(&kernel, None).await;
    ingest(
        &kernel,
        agent,
        "boleto",
        &[
            ("Posso pagar com boleto?", "Sim, aceitamos boleto."),
            ("O boleto vence quando", "Em três dias."),
        ],
    )
    .await;

    let report = kernel.analyze_conversations(agent, None, None).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
    assert_eq!(report.count(LearningStatus::Rejected), 1);
    let log = kernel
        .get_learning(report.candidates[0].learning_id.unwrap())
        .await
        .unwrap();
    assert_eq!(log.status, LearningStatus::Rejected);
    assert_eq!(log.reviewed_by.as_deref(), Some("system:auto"));
    assert_eq!(log.review_note.as_deref(), Some("low_confidence"));
    assert_eq!(kernel.substrate.memory().count_active(agent).unwrap(), 0);

    // Same evidence: nothing new to say.
    let rerun = kernel.analyze_conversations(agent, None, None).await.unwrap();
    assert!(rerun.candidates.is_empty());
}

#[tokio::test]
async fn registered_company_applies_without_context() {
    let kernel = kernel();
    let agent = AgentId::new();
    kernel
        .register_agent(agent, "client-1".into(), None, Some("acme".into()))
        .await
        .unwrap();
    let id = kernel
        .add_memory(
            agent,
            "Consultas duram 30 minutos".into(),
            ChunkType::Process,
            Some("acme".into()),
        )
        .await
        .unwrap();

    let ask = |context: RuntimeContext| EnrichRequest {
        message: "Quanto duram as consultas?".into(),
        context,
        base_prompt: None,
    };
    let enriched = kernel.enrich_prompt(agent, ask(RuntimeContext::new())).await;
    assert_eq!(enriched.memories_used.len(), 1);
    assert_eq!(enriched.memories_used[0].id, id);
    assert_eq!(enriched.memories_used[0].layer, Layer::Company);

    let other = kernel
        .enrich_prompt(agent, ask(context(json!({ "company_id": "globex" }))))
        .await;
    assert!(other.memories_used.is_empty());
}
