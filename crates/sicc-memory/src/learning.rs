//! Candidate learning log and the consolidation transaction.

use crate::behavior::{find_active_by_name, insert_pattern, prepare_pattern};
use crate::metrics::{bump, today, Counter};
use crate::semantic::{find_active_duplicate, insert_chunk, prepare_chunk};
use crate::sql::{self, lock, storage};
use rusqlite::{Connection, OptionalExtension, Row};
use sicc_types::agent::AgentId;
use sicc_types::config::MemorySettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::learning::{
    LearningId, LearningLog, LearningStatus, NewLearning, ReviewFailure, AUTO_REVIEWER,
};
use sicc_types::memory::{Layer, NewMemoryChunk};
use sicc_types::pattern::NewBehaviorPattern;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const LEARNING_COLUMNS: &str = "id, agent_id, learning_type, source_data, analysis, confidence, \
     status, reviewed_by, reviewed_at, review_note, created_at";

/// Review note stored on learnings rejected because they would duplicate a row.
pub const DUPLICATE_NOTE: &str = "duplicate";

/// The durable row an approved learning turns into.
#[derive(Debug, Clone)]
pub enum Consolidation {
    /// A memory chunk (already embedded).
    Memory(NewMemoryChunk),
    /// A behavior pattern.
    Pattern(NewBehaviorPattern),
}

/// What an approval created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consolidated {
    /// A memory chunk id.
    Memory(sicc_types::memory::MemoryId),
    /// A behavior pattern id.
    Pattern(sicc_types::pattern::PatternId),
}

/// Learning log store backed by SQLite.
#[derive(Clone)]
pub struct LearningStore {
    conn: Arc<Mutex<Connection>>,
    max_content_bytes: usize,
}

impl LearningStore {
    /// Create a new learning store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>, settings: &MemorySettings) -> Self {
        Self {
            conn,
            max_content_bytes: settings.max_content_bytes,
        }
    }

    /// Record a new candidate in `pending`.
    pub fn record(&self, learning: NewLearning) -> SiccResult<LearningLog> {
        if !(0.0..=1.0).contains(&learning.confidence) {
            return Err(SiccError::Validation(format!(
                "confidence {} outside [0, 1]",
                learning.confidence
            )));
        }
        let log = LearningLog {
            id: LearningId::new(),
            agent_id: learning.agent_id,
            learning_type: learning.learning_type,
            source_data: learning.source_data,
            analysis: learning.analysis,
            confidence: learning.confidence,
            status: LearningStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_note: None,
            created_at: sql::now_utc(),
        };
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO learning_logs (id, agent_id, learning_type, source_data, analysis,
                confidence, status, dedupe_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                log.id.0.to_string(),
                log.agent_id.0.to_string(),
                log.learning_type.as_str(),
                sql::to_json(&log.source_data)?,
                sql::to_json(&log.analysis)?,
                log.confidence as f64,
                log.status.as_str(),
                log.source_data.candidate.dedupe_key(),
                sql::ts(&log.created_at),
            ],
        )
        .map_err(storage)?;
        debug!(agent_id = %log.agent_id, learning_id = %log.id, "Recorded candidate learning");
        Ok(log)
    }

    /// An earlier learning of the agent with the same candidate key that
    /// settles a new proposal of `confidence`: one still open (pending,
    /// approved or applied), one a reviewer rejected, or one auto-rejected
    /// at the same or a higher confidence. A candidate auto-rejected for low
    /// confidence may come back once its evidence is stronger.
    pub fn find_existing(
        &self,
        agent_id: AgentId,
        dedupe_key: &str,
        confidence: f32,
    ) -> SiccResult<Option<LearningLog>> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            &format!(
                "SELECT {LEARNING_COLUMNS} FROM learning_logs
                 WHERE agent_id = ?1 AND dedupe_key = ?2
                   AND (status IN ('pending', 'approved', 'applied')
                        OR (status = 'rejected'
                            AND (reviewed_by IS NULL OR reviewed_by <> ?3 OR confidence >= ?4)))
                 ORDER BY created_at LIMIT 1"
            ),
            rusqlite::params![agent_id.0.to_string(), dedupe_key, AUTO_REVIEWER, confidence as f64],
            learning_from_row,
        )
        .optional()
        .map_err(storage)
    }

    /// Fetch a learning by id.
    pub fn get(&self, id: LearningId) -> SiccResult<LearningLog> {
        let conn = lock(&self.conn)?;
        get_learning(&conn, id)?.ok_or_else(|| SiccError::not_found("learning", id))
    }

    /// The agent's learnings, newest first.
    pub fn list(
        &self,
        agent_id: AgentId,
        status: Option<LearningStatus>,
        limit: usize,
        offset: usize,
    ) -> SiccResult<Vec<LearningLog>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LEARNING_COLUMNS} FROM learning_logs
                 WHERE agent_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id LIMIT ?3 OFFSET ?4"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    agent_id.0.to_string(),
                    status.map(|s| s.as_str()),
                    limit as i64,
                    offset as i64,
                ],
                learning_from_row,
            )
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Reject a pending learning.
    pub fn reject(&self, id: LearningId, reviewer: &str, reason: &str) -> SiccResult<LearningLog> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE learning_logs SET status = 'rejected', reviewed_by = ?1, reviewed_at = ?2,
                    review_note = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![reviewer, sql::ts(&sql::now_utc()), reason, id.0.to_string()],
            )
            .map_err(storage)?;
        let log = get_learning(&conn, id)?.ok_or_else(|| SiccError::not_found("learning", id))?;
        if n == 0 {
            return Err(SiccError::ReviewFailed(ReviewFailure::NotPending));
        }
        info!(learning_id = %id, reviewer, reason, "Learning rejected");
        Ok(log)
    }

    /// Approve a pending learning and consolidate it, all in one transaction.
    ///
    /// The learning moves `pending -> approved -> applied`, the durable row is
    /// created at the individual layer and today's `new_learnings` counter is
    /// bumped. If the row would duplicate an active one, the learning is
    /// rejected with note `duplicate` instead and `ReviewFailed(Duplicate)` is
    /// returned.
    pub fn approve_and_apply(
        &self,
        id: LearningId,
        reviewer: &str,
        consolidation: Consolidation,
    ) -> SiccResult<(LearningLog, Consolidated)> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;

        let log = get_learning(&tx, id)?.ok_or_else(|| SiccError::not_found("learning", id))?;
        if log.status != LearningStatus::Pending {
            return Err(SiccError::ReviewFailed(ReviewFailure::NotPending));
        }
        let reviewed_at = sql::ts(&sql::now_utc());
        tx.execute(
            "UPDATE learning_logs SET status = 'approved', reviewed_by = ?1, reviewed_at = ?2
             WHERE id = ?3",
            rusqlite::params![reviewer, reviewed_at, id.0.to_string()],
        )
        .map_err(storage)?;

        let created = match consolidation {
            Consolidation::Memory(chunk) => {
                let hash = sql::content_hash(&chunk.content);
                if find_active_duplicate(&tx, log.agent_id, &hash)?.is_some() {
                    None
                } else {
                    let chunk = prepare_chunk(&tx, chunk, self.max_content_bytes)?;
                    insert_chunk(&tx, &chunk)?;
                    Some(Consolidated::Memory(chunk.id))
                }
            }
            Consolidation::Pattern(pattern) => {
                let pattern = prepare_pattern(&tx, pattern)?;
                if find_active_by_name(&tx, log.agent_id, Layer::Individual, &pattern.pattern_name)?
                    .is_some()
                {
                    None
                } else {
                    insert_pattern(&tx, &pattern)?;
                    Some(Consolidated::Pattern(pattern.id))
                }
            }
        };

        let Some(created) = created else {
            tx.execute(
                "UPDATE learning_logs SET status = 'rejected', review_note = ?1 WHERE id = ?2",
                rusqlite::params![DUPLICATE_NOTE, id.0.to_string()],
            )
            .map_err(storage)?;
            tx.commit().map_err(storage)?;
            info!(learning_id = %id, "Learning rejected as duplicate");
            return Err(SiccError::ReviewFailed(ReviewFailure::Duplicate));
        };

        let note = match created {
            Consolidated::Memory(mid) => format!("memory {mid}"),
            Consolidated::Pattern(pid) => format!("pattern {pid}"),
        };
        tx.execute(
            "UPDATE learning_logs SET status = 'applied', review_note = ?1 WHERE id = ?2",
            rusqlite::params![note, id.0.to_string()],
        )
        .map_err(storage)?;
        bump(&tx, log.agent_id, today(), Counter::NewLearnings, 1)?;
        let applied = get_learning(&tx, id)?.ok_or_else(|| SiccError::not_found("learning", id))?;
        tx.commit().map_err(storage)?;
        info!(learning_id = %id, agent_id = %log.agent_id, reviewer, "Learning applied");
        Ok((applied, created))
    }
}

fn get_learning(conn: &Connection, id: LearningId) -> SiccResult<Option<LearningLog>> {
    conn.query_row(
        &format!("SELECT {LEARNING_COLUMNS} FROM learning_logs WHERE id = ?1"),
        rusqlite::params![id.0.to_string()],
        learning_from_row,
    )
    .optional()
    .map_err(storage)
}

fn learning_from_row(row: &Row<'_>) -> rusqlite::Result<LearningLog> {
    let id: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let learning_type: String = row.get(2)?;
    let source_data: String = row.get(3)?;
    let analysis: String = row.get(4)?;
    let confidence: f64 = row.get(5)?;
    let status: String = row.get(6)?;
    let reviewed_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    Ok(LearningLog {
        id: LearningId(sql::parse_uuid(0, &id)?),
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        learning_type: sql::parse_label(2, &learning_type)?,
        source_data: sql::parse_json(3, &source_data)?,
        analysis: sql::parse_json(4, &analysis)?,
        confidence: confidence as f32,
        status: sql::parse_label(6, &status)?,
        reviewed_by: row.get(7)?,
        reviewed_at: reviewed_at
            .as_deref()
            .map(|raw| sql::parse_ts(8, raw))
            .transpose()?,
        review_note: row.get(9)?,
        created_at: sql::parse_ts(10, &created_at)?,
    })
}
