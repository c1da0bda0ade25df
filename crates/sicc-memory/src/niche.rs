//! Niche versions and the per-agent propagation ledger.
//!
//! A propagation record is keyed by `(version_id, agent_id)` and is "open"
//! until `rolled_back_at` is set. Each agent's snapshot, inserts and record
//! upsert commit in one transaction; so does each agent's rollback.

use crate::behavior::{self, find_active_by_name, insert_pattern, prepare_pattern};
use crate::semantic::{self, find_active_duplicate, insert_chunk, prepare_chunk};
use crate::snapshot::{capture, restore};
use crate::sql::{self, lock, storage};
use rusqlite::{Connection, Row};
use serde_json::json;
use sicc_types::agent::{AgentId, AgentRecord};
use sicc_types::config::MemorySettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::{Layer, Metadata, NewMemoryChunk};
use sicc_types::niche::{
    AgentOpStatus, AgentPropagation, AgentRollback, BundleMemory, BundlePattern, NicheVersion,
    NicheVersionId, NicheVersionStatus, PropagationRecord,
};
use sicc_types::pattern::NewBehaviorPattern;
use sicc_types::snapshot::{SnapshotId, SNAPSHOT_TYPE_KEY, SNAPSHOT_TYPE_PRE_PROPAGATION};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const VERSION_COLUMNS: &str =
    "id, niche_type, version_name, memories, patterns, status, is_active, created_at";

const PROPAGATION_COLUMNS: &str = "version_id, agent_id, snapshot_id, memories_inserted, \
     patterns_inserted, propagated_at, rolled_back_at";

/// Niche version store backed by SQLite.
#[derive(Clone)]
pub struct NicheStore {
    conn: Arc<Mutex<Connection>>,
    max_content_bytes: usize,
}

impl NicheStore {
    /// Create a new niche store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>, settings: &MemorySettings) -> Self {
        Self {
            conn,
            max_content_bytes: settings.max_content_bytes,
        }
    }

    /// Create a `draft` version. The name defaults to `v{n}`, `n` being the
    /// niche's version count after the insert.
    pub fn create_version(
        &self,
        niche_type: &str,
        version_name: Option<String>,
        memories: Vec<BundleMemory>,
        patterns: Vec<BundlePattern>,
    ) -> SiccResult<NicheVersion> {
        if niche_type.trim().is_empty() {
            return Err(SiccError::Validation("niche_type must not be empty".into()));
        }
        if let Some(m) = memories.iter().find(|m| m.content.trim().is_empty()) {
            return Err(SiccError::Validation(format!(
                "bundle memory content must not be empty ({:?})",
                m.content
            )));
        }
        if let Some(m) = memories.iter().find(|m| m.content.len() > self.max_content_bytes) {
            return Err(SiccError::Validation(format!(
                "bundle memory is {} bytes, limit is {}",
                m.content.len(),
                self.max_content_bytes
            )));
        }
        let mut names = HashSet::new();
        for p in &patterns {
            if p.pattern_name.trim().is_empty() {
                return Err(SiccError::Validation("bundle pattern_name must not be empty".into()));
            }
            if !names.insert(p.pattern_name.as_str()) {
                return Err(SiccError::Validation(format!(
                    "bundle pattern '{}' appears twice",
                    p.pattern_name
                )));
            }
        }

        let conn = lock(&self.conn)?;
        let existing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM niche_versions WHERE niche_type = ?1",
                rusqlite::params![niche_type],
                |row| row.get(0),
            )
            .map_err(storage)?;
        let version = NicheVersion {
            id: NicheVersionId::new(),
            niche_type: niche_type.to_string(),
            version_name: version_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("v{}", existing + 1)),
            memories,
            patterns,
            status: NicheVersionStatus::Draft,
            is_active: false,
            created_at: sql::now_utc(),
        };
        conn.execute(
            "INSERT INTO niche_versions (id, niche_type, version_name, memories, patterns,
                status, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            rusqlite::params![
                version.id.0.to_string(),
                version.niche_type,
                version.version_name,
                sql::to_json(&version.memories)?,
                sql::to_json(&version.patterns)?,
                version.status.as_str(),
                sql::ts(&version.created_at),
            ],
        )
        .map_err(storage)?;
        info!(
            version_id = %version.id,
            niche = %version.niche_type,
            name = %version.version_name,
            "Niche version created"
        );
        Ok(version)
    }

    /// Fetch a version by id.
    pub fn get_version(&self, id: NicheVersionId) -> SiccResult<NicheVersion> {
        let conn = lock(&self.conn)?;
        get_version(&conn, id)?.ok_or_else(|| SiccError::not_found("niche version", id))
    }

    /// Versions of one niche (or all), newest first.
    pub fn list_versions(&self, niche_type: Option<&str>) -> SiccResult<Vec<NicheVersion>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM niche_versions
                 WHERE (?1 IS NULL OR niche_type = ?1)
                 ORDER BY created_at DESC, id"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![niche_type], version_from_row)
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Delete a version. Refused while any propagation of it is open.
    pub fn delete_version(&self, id: NicheVersionId) -> SiccResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        if get_version(&tx, id)?.is_none() {
            return Err(SiccError::not_found("niche version", id));
        }
        let open = open_agents(&tx, id)?;
        if !open.is_empty() {
            return Err(SiccError::Conflict(format!(
                "niche version {id} is still propagated to {} agent(s); roll back first",
                open.len()
            )));
        }
        tx.execute(
            "DELETE FROM niche_propagations WHERE version_id = ?1",
            rusqlite::params![id.0.to_string()],
        )
        .map_err(storage)?;
        tx.execute(
            "DELETE FROM niche_versions WHERE id = ?1",
            rusqlite::params![id.0.to_string()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        info!(version_id = %id, "Niche version deleted");
        Ok(())
    }

    /// Propagation records of a version, oldest first.
    pub fn list_propagations(&self, id: NicheVersionId) -> SiccResult<Vec<PropagationRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PROPAGATION_COLUMNS} FROM niche_propagations
                 WHERE version_id = ?1 ORDER BY propagated_at, agent_id"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![id.0.to_string()], propagation_from_row)
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Agents currently carrying the version.
    pub fn open_agents(&self, id: NicheVersionId) -> SiccResult<Vec<AgentId>> {
        let conn = lock(&self.conn)?;
        open_agents(&conn, id)
    }

    /// Install a version's bundle into one agent, in one transaction.
    ///
    /// `memories` and `patterns` must already carry the base-layer keys for
    /// this version. Rows duplicating an active memory (same normalized
    /// content) or an active base pattern (same name) are skipped, so a repeat
    /// propagation inserts nothing. The pre-propagation snapshot is taken only
    /// when the agent does not already carry the version.
    pub fn apply_propagation(
        &self,
        version_id: NicheVersionId,
        agent: &AgentRecord,
        memories: Vec<NewMemoryChunk>,
        patterns: Vec<NewBehaviorPattern>,
        create_snapshot: bool,
    ) -> SiccResult<AgentPropagation> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        let version = get_version(&tx, version_id)?
            .ok_or_else(|| SiccError::not_found("niche version", version_id))?;
        let agent_id = agent.agent_id;
        let previous = get_propagation(&tx, version_id, agent_id)?;
        let open = previous.filter(|r| r.rolled_back_at.is_none());

        let snapshot_id = match &open {
            Some(record) => record.snapshot_id,
            None if create_snapshot => {
                let mut metadata = Metadata::new();
                metadata.insert(SNAPSHOT_TYPE_KEY.into(), json!(SNAPSHOT_TYPE_PRE_PROPAGATION));
                metadata.insert("version_id".into(), json!(version_id.to_string()));
                let name = format!("pre_propagation {} {}", version.niche_type, version.version_name);
                Some(capture(&tx, agent_id, &name, metadata)?.id)
            }
            None => None,
        };

        let mut memories_inserted = 0;
        let mut patterns_inserted = 0;
        let mut skipped_duplicates = 0;
        for new in memories {
            let hash = sql::content_hash(&new.content);
            if find_active_duplicate(&tx, agent_id, &hash)?.is_some() {
                skipped_duplicates += 1;
                continue;
            }
            let chunk = prepare_chunk(&tx, new, self.max_content_bytes)?;
            insert_chunk(&tx, &chunk)?;
            memories_inserted += 1;
        }
        for new in patterns {
            if find_active_by_name(&tx, agent_id, Layer::Base, &new.pattern_name)?.is_some() {
                skipped_duplicates += 1;
                continue;
            }
            let pattern = prepare_pattern(&tx, new)?;
            insert_pattern(&tx, &pattern)?;
            patterns_inserted += 1;
        }

        let (total_memories, total_patterns) = match &open {
            Some(record) => (
                record.memories_inserted + memories_inserted,
                record.patterns_inserted + patterns_inserted,
            ),
            None => (memories_inserted, patterns_inserted),
        };
        tx.execute(
            "INSERT OR REPLACE INTO niche_propagations (version_id, agent_id, snapshot_id,
                memories_inserted, patterns_inserted, propagated_at, rolled_back_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            rusqlite::params![
                version_id.0.to_string(),
                agent_id.0.to_string(),
                snapshot_id.map(|s| s.0.to_string()),
                total_memories as i64,
                total_patterns as i64,
                sql::ts(&sql::now_utc()),
            ],
        )
        .map_err(storage)?;
        tx.execute(
            "UPDATE niche_versions SET is_active = 0 WHERE niche_type = ?1 AND id != ?2",
            rusqlite::params![version.niche_type, version_id.0.to_string()],
        )
        .map_err(storage)?;
        tx.execute(
            "UPDATE niche_versions SET status = 'active', is_active = 1 WHERE id = ?1",
            rusqlite::params![version_id.0.to_string()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;

        debug!(
            version_id = %version_id,
            agent_id = %agent_id,
            memories_inserted,
            patterns_inserted,
            skipped_duplicates,
            "Propagated niche version to agent"
        );
        Ok(AgentPropagation {
            agent_id,
            status: AgentOpStatus::Success,
            snapshot_id,
            memories_inserted,
            patterns_inserted,
            skipped_duplicates,
            error: None,
        })
    }

    /// Remove a version from one agent, in one transaction.
    ///
    /// Restores the pre-propagation snapshot when there is one, then deletes
    /// any row of the agent still carrying the version id. Returns `None` when
    /// the agent does not carry the version, which makes a repeat rollback a
    /// no-op. Once no agent carries the version it becomes `rolled_back`.
    pub fn apply_rollback(
        &self,
        version_id: NicheVersionId,
        agent_id: AgentId,
    ) -> SiccResult<Option<AgentRollback>> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        let Some(record) =
            get_propagation(&tx, version_id, agent_id)?.filter(|r| r.rolled_back_at.is_none())
        else {
            return Ok(None);
        };

        let mut restored_snapshot = false;
        if let Some(snapshot_id) = record.snapshot_id {
            match restore(&tx, snapshot_id) {
                Ok(_) => restored_snapshot = true,
                // Snapshot deleted since; fall back to deleting by version id.
                Err(SiccError::NotFound { .. }) | Err(SiccError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let version = version_id.to_string();
        let rows_deleted = semantic::delete_by_version(&tx, agent_id, &version)?
            + behavior::delete_by_version(&tx, agent_id, &version)?;

        tx.execute(
            "UPDATE niche_propagations SET rolled_back_at = ?1 WHERE version_id = ?2 AND agent_id = ?3",
            rusqlite::params![
                sql::ts(&sql::now_utc()),
                version_id.0.to_string(),
                agent_id.0.to_string()
            ],
        )
        .map_err(storage)?;
        if open_agents(&tx, version_id)?.is_empty() {
            tx.execute(
                "UPDATE niche_versions SET status = 'rolled_back', is_active = 0 WHERE id = ?1",
                rusqlite::params![version_id.0.to_string()],
            )
            .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        debug!(
            version_id = %version_id,
            agent_id = %agent_id,
            restored_snapshot,
            rows_deleted,
            "Rolled back niche version for agent"
        );
        Ok(Some(AgentRollback {
            agent_id,
            status: AgentOpStatus::Success,
            restored_snapshot,
            rows_deleted,
            error: None,
        }))
    }
}

fn get_version(conn: &Connection, id: NicheVersionId) -> SiccResult<Option<NicheVersion>> {
    let result = conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM niche_versions WHERE id = ?1"),
        rusqlite::params![id.0.to_string()],
        version_from_row,
    );
    match result {
        Ok(version) => Ok(Some(version)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

fn get_propagation(
    conn: &Connection,
    version_id: NicheVersionId,
    agent_id: AgentId,
) -> SiccResult<Option<PropagationRecord>> {
    let result = conn.query_row(
        &format!(
            "SELECT {PROPAGATION_COLUMNS} FROM niche_propagations
             WHERE version_id = ?1 AND agent_id = ?2"
        ),
        rusqlite::params![version_id.0.to_string(), agent_id.0.to_string()],
        propagation_from_row,
    );
    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

fn open_agents(conn: &Connection, version_id: NicheVersionId) -> SiccResult<Vec<AgentId>> {
    let mut stmt = conn
        .prepare(
            "SELECT agent_id FROM niche_propagations
             WHERE version_id = ?1 AND rolled_back_at IS NULL ORDER BY propagated_at, agent_id",
        )
        .map_err(storage)?;
    let rows = stmt
        .query_map(rusqlite::params![version_id.0.to_string()], |row| {
            let raw: String = row.get(0)?;
            sql::parse_uuid(0, &raw).map(AgentId)
        })
        .map_err(storage)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(storage)
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<NicheVersion> {
    let id: String = row.get(0)?;
    let memories: String = row.get(3)?;
    let patterns: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(NicheVersion {
        id: NicheVersionId(sql::parse_uuid(0, &id)?),
        niche_type: row.get(1)?,
        version_name: row.get(2)?,
        memories: sql::parse_json(3, &memories)?,
        patterns: sql::parse_json(4, &patterns)?,
        status: sql::parse_label(5, &status)?,
        is_active: row.get(6)?,
        created_at: sql::parse_ts(7, &created_at)?,
    })
}

fn propagation_from_row(row: &Row<'_>) -> rusqlite::Result<PropagationRecord> {
    let version: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let snapshot: Option<String> = row.get(2)?;
    let propagated_at: String = row.get(5)?;
    let rolled_back_at: Option<String> = row.get(6)?;
    Ok(PropagationRecord {
        version_id: NicheVersionId(sql::parse_uuid(0, &version)?),
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        snapshot_id: snapshot
            .as_deref()
            .map(|raw| sql::parse_uuid(2, raw).map(SnapshotId))
            .transpose()?,
        memories_inserted: row.get::<_, i64>(3)? as usize,
        patterns_inserted: row.get::<_, i64>(4)? as usize,
        propagated_at: sql::parse_ts(5, &propagated_at)?,
        rolled_back_at: rolled_back_at
            .as_deref()
            .map(|raw| sql::parse_ts(6, raw))
            .transpose()?,
    })
}
