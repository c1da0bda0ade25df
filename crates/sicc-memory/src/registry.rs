//! Agent registry: niche and company membership of each agent.

use crate::sql::{self, lock, storage};
use rusqlite::{Connection, Row};
use sicc_types::agent::{AgentId, AgentRecord};
use sicc_types::error::{SiccError, SiccResult};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Tables holding rows owned by an agent, removed with it.
const OWNED_TABLES: &[&str] = &[
    "memory_chunks",
    "behavior_patterns",
    "learning_logs",
    "snapshots",
    "daily_metrics",
    "conversations",
    "niche_propagations",
];

/// Agent registry backed by SQLite.
#[derive(Clone)]
pub struct AgentStore {
    conn: Arc<Mutex<Connection>>,
}

impl AgentStore {
    /// Create a new agent store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Register an agent, or update its client, niche and company.
    pub fn register(
        &self,
        agent_id: AgentId,
        client_id: &str,
        niche_type: Option<String>,
        company_id: Option<String>,
    ) -> SiccResult<AgentRecord> {
        if client_id.trim().is_empty() {
            return Err(SiccError::Validation("client_id must not be empty".into()));
        }
        let niche_type = niche_type.filter(|n| !n.trim().is_empty());
        let company_id = company_id.filter(|c| !c.trim().is_empty());
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO agents (agent_id, client_id, niche_type, company_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_id) DO UPDATE SET client_id = ?2, niche_type = ?3, company_id = ?4",
            rusqlite::params![
                agent_id.0.to_string(),
                client_id,
                niche_type,
                company_id,
                sql::ts(&sql::now_utc()),
            ],
        )
        .map_err(storage)?;
        let record = get_agent(&conn, agent_id)?.ok_or_else(|| SiccError::not_found("agent", agent_id))?;
        info!(
            agent_id = %agent_id,
            niche = record.niche_type.as_deref().unwrap_or("-"),
            "Agent registered"
        );
        Ok(record)
    }

    /// Fetch a registered agent.
    pub fn get(&self, agent_id: AgentId) -> SiccResult<AgentRecord> {
        let conn = lock(&self.conn)?;
        get_agent(&conn, agent_id)?.ok_or_else(|| SiccError::not_found("agent", agent_id))
    }

    /// Registered agents, optionally of one niche, oldest first.
    pub fn list(&self, niche_type: Option<&str>) -> SiccResult<Vec<AgentRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, client_id, niche_type, company_id, created_at FROM agents
                 WHERE (?1 IS NULL OR niche_type = ?1)
                 ORDER BY created_at, agent_id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![niche_type], agent_from_row)
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Delete an agent and everything it owns, in one transaction.
    pub fn delete_agent(&self, agent_id: AgentId) -> SiccResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        let n = tx
            .execute(
                "DELETE FROM agents WHERE agent_id = ?1",
                rusqlite::params![agent_id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("agent", agent_id));
        }
        let mut removed = 0;
        for table in OWNED_TABLES {
            removed += tx
                .execute(
                    &format!("DELETE FROM {table} WHERE agent_id = ?1"),
                    rusqlite::params![agent_id.0.to_string()],
                )
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        info!(agent_id = %agent_id, rows = removed, "Agent deleted");
        Ok(())
    }
}

fn get_agent(conn: &Connection, agent_id: AgentId) -> SiccResult<Option<AgentRecord>> {
    let result = conn.query_row(
        "SELECT agent_id, client_id, niche_type, company_id, created_at FROM agents
         WHERE agent_id = ?1",
        rusqlite::params![agent_id.0.to_string()],
        agent_from_row,
    );
    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let agent: String = row.get(0)?;
    let created_at: String = row.get(4)?;
    Ok(AgentRecord {
        agent_id: AgentId(sql::parse_uuid(0, &agent)?),
        client_id: row.get(1)?,
        niche_type: row.get(2)?,
        company_id: row.get(3)?,
        created_at: sql::parse_ts(4, &created_at)?,
    })
}
