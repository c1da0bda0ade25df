//! Quota pruning.
//!
//! Brings an agent back under its soft memory quota by deactivating the
//! chunks least worth keeping, scored `confidence_score * ln(1 + usage_count)`.

use crate::sql::{self, lock, storage};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sicc_types::agent::AgentId;
use sicc_types::error::SiccResult;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Result of one prune cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Chunks deactivated.
    pub deactivated: u64,
    /// Active chunks left.
    pub active_after: u64,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// Retention score of a chunk; lower is pruned first.
pub fn retention_score(confidence: f32, usage_count: u64) -> f64 {
    confidence as f64 * (1.0 + usage_count as f64).ln()
}

/// Quota prune engine.
#[derive(Clone)]
pub struct PruneEngine {
    conn: Arc<Mutex<Connection>>,
}

impl PruneEngine {
    /// Create a new prune engine.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Deactivate the lowest-scoring active chunks of the agent until at most
    /// `quota` remain. Ties go oldest first.
    pub fn prune_agent(&self, agent_id: AgentId, quota: u64) -> SiccResult<PruneReport> {
        let start = std::time::Instant::now();
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;

        let mut scored: Vec<(String, f64, DateTime<Utc>)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, confidence_score, usage_count, created_at FROM memory_chunks
                     WHERE agent_id = ?1 AND is_active = 1",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(rusqlite::params![agent_id.0.to_string()], |row| {
                    let id: String = row.get(0)?;
                    let confidence: f64 = row.get(1)?;
                    let usage: i64 = row.get(2)?;
                    let created_at: String = row.get(3)?;
                    Ok((
                        id,
                        retention_score(confidence as f32, usage.max(0) as u64),
                        sql::parse_ts(3, &created_at)?,
                    ))
                })
                .map_err(storage)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage)?
        };

        let active = scored.len() as u64;
        if active <= quota {
            return Ok(PruneReport {
                deactivated: 0,
                active_after: active,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
        let excess = (active - quota) as usize;
        for (id, _, _) in scored.iter().take(excess) {
            tx.execute(
                "UPDATE memory_chunks SET is_active = 0 WHERE id = ?1",
                rusqlite::params![id],
            )
            .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        let report = PruneReport {
            deactivated: excess as u64,
            active_after: quota,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            agent_id = %agent_id,
            deactivated = report.deactivated,
            active_after = report.active_after,
            "Pruned memory chunks over quota"
        );
        Ok(report)
    }
}
