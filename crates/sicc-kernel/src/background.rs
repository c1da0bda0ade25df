//! Background workers: quota pruning and scheduled transcript analysis.
//!
//! Both loops stop when the kernel's shutdown token is cancelled. The prune
//! worker drains agent ids sent by the memory store whenever an agent goes
//! over its soft quota; the analysis worker wakes every
//! `schedule_interval_secs` and analyzes every registered agent.

use crate::blocking::run_blocking;
use crate::learning::LearningPipeline;
use crate::locks::AgentLocks;
use sicc_memory::SiccSubstrate;
use sicc_types::agent::AgentId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawn the quota prune worker.
pub fn spawn_prune_worker(
    substrate: SiccSubstrate,
    locks: Arc<AgentLocks>,
    mut rx: UnboundedReceiver<AgentId>,
    quota: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(quota, "Starting quota prune worker");
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Prune worker: shutdown signal received");
                    break;
                }
                next = rx.recv() => match next {
                    Some(agent_id) => agent_id,
                    None => break,
                },
            };

            // One prune per agent no matter how many inserts queued it.
            let mut batch = vec![first];
            let mut seen = HashSet::from([first]);
            while let Ok(agent_id) = rx.try_recv() {
                if seen.insert(agent_id) {
                    batch.push(agent_id);
                }
            }

            for agent_id in batch {
                let _guard = locks.lock(agent_id).await;
                let substrate = substrate.clone();
                match run_blocking(move || substrate.pruner().prune_agent(agent_id, quota)).await {
                    Ok(report) => info!(
                        agent_id = %agent_id,
                        deactivated = report.deactivated,
                        active = report.active_after,
                        duration_ms = report.duration_ms,
                        "Quota prune complete"
                    ),
                    Err(e) => warn!(agent_id = %agent_id, error = %e, "Quota prune failed"),
                }
            }
        }
    })
}

/// Spawn the scheduled analysis worker. `None` when `interval` is zero.
pub fn spawn_analysis_worker(
    substrate: SiccSubstrate,
    pipeline: LearningPipeline,
    interval: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!("Scheduled analysis disabled");
        return None;
    }
    info!(interval_secs = interval.as_secs(), "Starting scheduled analysis worker");
    let busy = Arc::new(AtomicBool::new(false));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Analysis worker: shutdown signal received");
                    break;
                }
            }

            if busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Analysis worker: skipping tick (busy)");
                continue;
            }
            run_analysis_cycle(&substrate, &pipeline, &shutdown).await;
            busy.store(false, Ordering::SeqCst);
        }
    }))
}

/// Analyze every registered agent once.
pub async fn run_analysis_cycle(
    substrate: &SiccSubstrate,
    pipeline: &LearningPipeline,
    shutdown: &CancellationToken,
) {
    let agents = {
        let substrate = substrate.clone();
        match run_blocking(move || substrate.agents().list(None)).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Analysis cycle: cannot list agents");
                return;
            }
        }
    };

    let settings = pipeline.settings().clone();
    let mut candidates = 0usize;
    for agent in &agents {
        if shutdown.is_cancelled() {
            break;
        }
        match pipeline
            .analyze_conversations(
                agent.agent_id,
                settings.time_window_hours,
                settings.min_messages,
                shutdown,
            )
            .await
        {
            Ok(report) => candidates += report.candidates.len(),
            Err(e) => warn!(agent_id = %agent.agent_id, error = %e, "Scheduled analysis failed"),
        }
    }
    info!(agents = agents.len(), candidates, "Analysis cycle complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::TranscriptSource;
    use sicc_runtime::embedding_service::EmbeddingService;
    use sicc_types::config::{EmbeddingSettings, LearningSettings, MemorySettings};
    use sicc_types::memory::{ChunkType, EMBEDDING_DIM, NewMemoryChunk};

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_prune_worker_brings_agent_back_to_quota() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let settings = MemorySettings {
            agent_memory_quota: 2,
            ..MemorySettings::default()
        };
        let substrate = SiccSubstrate::open_in_memory(&settings)
            .unwrap()
            .with_prune_notifier(tx);
        let shutdown = CancellationToken::new();
        let handle = spawn_prune_worker(
            substrate.clone(),
            Arc::new(AgentLocks::new()),
            rx,
            settings.agent_memory_quota,
            shutdown.clone(),
        );

        let agent = AgentId::new();
        for i in 0..4 {
            substrate
                .memory()
                .create(NewMemoryChunk::new(agent, "c1", format!("fato {i}"), ChunkType::Product, unit(i)))
                .unwrap();
        }

        let mut active = u64::MAX;
        for _ in 0..100 {
            active = substrate.memory().count_active(agent).unwrap();
            if active <= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(active, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_disables_analysis() {
        let substrate = SiccSubstrate::open_in_memory(&MemorySettings::default()).unwrap();
        let source: Arc<dyn TranscriptSource> = Arc::new(substrate.conversations().clone());
        let pipeline = LearningPipeline::new(
            substrate.clone(),
            Arc::new(EmbeddingService::load(&EmbeddingSettings::default()).unwrap()),
            source,
            LearningSettings::default(),
            Arc::new(AgentLocks::new()),
        );
        let shutdown = CancellationToken::new();
        assert!(spawn_analysis_worker(substrate.clone(), pipeline.clone(), Duration::ZERO, shutdown.clone()).is_none());

        let handle =
            spawn_analysis_worker(substrate, pipeline, Duration::from_secs(3600), shutdown.clone()).unwrap();
        shutdown.cancel();
        handle.await.unwrap();
    }
}
