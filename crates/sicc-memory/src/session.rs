//! Conversation transcript store, the input of transcript analysis.

use crate::sql::{self, lock, storage};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::transcript::Transcript;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Conversation store backed by SQLite.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Create a new conversation store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Store (or replace by id) a completed conversation.
    pub fn ingest(&self, transcript: &Transcript) -> SiccResult<()> {
        if transcript.id.trim().is_empty() {
            return Err(SiccError::Validation("conversation id must not be empty".into()));
        }
        if let Some(s) = transcript.satisfaction {
            if !(0.0..=5.0).contains(&s) {
                return Err(SiccError::Validation(format!("satisfaction {s} outside [0, 5]")));
            }
        }
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO conversations (id, agent_id, messages, satisfaction, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                transcript.id,
                transcript.agent_id.0.to_string(),
                sql::to_json(&transcript.messages)?,
                transcript.satisfaction,
                sql::ts(&transcript.started_at),
            ],
        )
        .map_err(storage)?;
        debug!(
            agent_id = %transcript.agent_id,
            conversation = %transcript.id,
            messages = transcript.messages.len(),
            "Conversation ingested"
        );
        Ok(())
    }

    /// The agent's conversations started at or after `since`, oldest first.
    pub fn get_conversations(
        &self,
        agent_id: AgentId,
        since: DateTime<Utc>,
    ) -> SiccResult<Vec<Transcript>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, agent_id, messages, satisfaction, started_at FROM conversations
                 WHERE agent_id = ?1 AND started_at >= ?2
                 ORDER BY started_at, id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(
                rusqlite::params![agent_id.0.to_string(), sql::ts(&since)],
                transcript_from_row,
            )
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Number of stored conversations of the agent.
    pub fn count(&self, agent_id: AgentId) -> SiccResult<u64> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE agent_id = ?1",
                rusqlite::params![agent_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(n.max(0) as u64)
    }
}

fn transcript_from_row(row: &Row<'_>) -> rusqlite::Result<Transcript> {
    let agent: String = row.get(1)?;
    let messages: String = row.get(2)?;
    let started_at: String = row.get(4)?;
    Ok(Transcript {
        id: row.get(0)?,
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        messages: sql::parse_json(2, &messages)?,
        satisfaction: row.get(3)?,
        started_at: sql::parse_ts(4, &started_at)?,
    })
}
