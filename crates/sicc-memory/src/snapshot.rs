//! Snapshot engine: frozen copies of an agent's active knowledge.
//!
//! Payloads are MessagePack with named fields so rows stay readable after
//! the chunk and pattern structs gain fields. Capture and restore run in a
//! single transaction, so readers observe either the old or the new state.

use crate::behavior::{insert_pattern, load_active_patterns};
use crate::semantic::{insert_chunk, load_active_chunks};
use crate::sql::{self, lock, storage};
use rusqlite::{Connection, Row};
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::Metadata;
use sicc_types::snapshot::{RestoreReport, Snapshot, SnapshotId, SnapshotPayload};
use std::sync::{Arc, Mutex};
use tracing::info;

const SNAPSHOT_COLUMNS: &str =
    "id, agent_id, name, metadata, memory_count, pattern_count, is_active, created_at";

/// Snapshot store backed by SQLite.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Create a new snapshot store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Capture the agent's active memories and patterns. Live data is untouched.
    pub fn create_snapshot(
        &self,
        agent_id: AgentId,
        name: &str,
        metadata: Metadata,
    ) -> SiccResult<Snapshot> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        let snapshot = capture(&tx, agent_id, name, metadata)?;
        tx.commit().map_err(storage)?;
        info!(
            agent_id = %agent_id,
            snapshot_id = %snapshot.id,
            memories = snapshot.memory_count,
            patterns = snapshot.pattern_count,
            "Snapshot created"
        );
        Ok(snapshot)
    }

    /// Replace the agent's active memories and patterns with the snapshot payload.
    ///
    /// All or nothing: on any error the live state is unchanged.
    pub fn restore_snapshot(&self, id: SnapshotId) -> SiccResult<RestoreReport> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(storage)?;
        let report = restore(&tx, id)?;
        tx.commit().map_err(storage)?;
        info!(
            agent_id = %report.agent_id,
            snapshot_id = %id,
            memories = report.memories_restored,
            patterns = report.patterns_restored,
            "Snapshot restored"
        );
        Ok(report)
    }

    /// Snapshot header and payload.
    pub fn get_snapshot(&self, id: SnapshotId) -> SiccResult<(Snapshot, SnapshotPayload)> {
        let conn = lock(&self.conn)?;
        load(&conn, id)?.ok_or_else(|| SiccError::not_found("snapshot", id))
    }

    /// The agent's snapshots, newest first.
    pub fn list_snapshots(&self, agent_id: AgentId) -> SiccResult<Vec<Snapshot>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE agent_id = ?1
                 ORDER BY created_at DESC"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.0.to_string()], snapshot_from_row)
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Delete a snapshot.
    pub fn delete_snapshot(&self, id: SnapshotId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "DELETE FROM snapshots WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("snapshot", id));
        }
        Ok(())
    }
}

/// Capture inside an open transaction.
pub(crate) fn capture(
    conn: &Connection,
    agent_id: AgentId,
    name: &str,
    metadata: Metadata,
) -> SiccResult<Snapshot> {
    let payload = SnapshotPayload {
        memories: load_active_chunks(conn, agent_id)?,
        patterns: load_active_patterns(conn, agent_id)?,
    };
    let blob = rmp_serde::to_vec_named(&payload)
        .map_err(|e| SiccError::Serialization(e.to_string()))?;
    let snapshot = Snapshot {
        id: SnapshotId::new(),
        agent_id,
        name: name.to_string(),
        metadata,
        memory_count: payload.memories.len(),
        pattern_count: payload.patterns.len(),
        is_active: true,
        created_at: sql::now_utc(),
    };
    conn.execute(
        "INSERT INTO snapshots (id, agent_id, name, metadata, payload, memory_count,
            pattern_count, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
        rusqlite::params![
            snapshot.id.0.to_string(),
            agent_id.0.to_string(),
            snapshot.name,
            sql::to_json(&snapshot.metadata)?,
            blob,
            snapshot.memory_count as i64,
            snapshot.pattern_count as i64,
            sql::ts(&snapshot.created_at),
        ],
    )
    .map_err(storage)?;
    Ok(snapshot)
}

/// Restore inside an open transaction.
pub(crate) fn restore(conn: &Connection, id: SnapshotId) -> SiccResult<RestoreReport> {
    let (snapshot, payload) = load(conn, id)?.ok_or_else(|| SiccError::not_found("snapshot", id))?;
    if !snapshot.is_active {
        return Err(SiccError::Conflict(format!("snapshot {id} is no longer restorable")));
    }
    let agent = snapshot.agent_id.0.to_string();
    let memories_removed = conn
        .execute(
            "DELETE FROM memory_chunks WHERE agent_id = ?1 AND is_active = 1",
            rusqlite::params![agent],
        )
        .map_err(storage)?;
    let patterns_removed = conn
        .execute(
            "DELETE FROM behavior_patterns WHERE agent_id = ?1 AND is_active = 1",
            rusqlite::params![agent],
        )
        .map_err(storage)?;
    for chunk in &payload.memories {
        insert_chunk(conn, chunk)?;
    }
    for pattern in &payload.patterns {
        insert_pattern(conn, pattern)?;
    }
    Ok(RestoreReport {
        snapshot_id: id,
        agent_id: snapshot.agent_id,
        memories_removed,
        patterns_removed,
        memories_restored: payload.memories.len(),
        patterns_restored: payload.patterns.len(),
    })
}

fn load(conn: &Connection, id: SnapshotId) -> SiccResult<Option<(Snapshot, SnapshotPayload)>> {
    let result = conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS}, payload FROM snapshots WHERE id = ?1"),
        rusqlite::params![id.0.to_string()],
        |row| {
            let snapshot = snapshot_from_row(row)?;
            let blob: Vec<u8> = row.get(8)?;
            Ok((snapshot, blob))
        },
    );
    let (snapshot, blob) = match result {
        Ok(found) => found,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(storage(e)),
    };
    let payload: SnapshotPayload =
        rmp_serde::from_slice(&blob).map_err(|e| SiccError::Serialization(e.to_string()))?;
    Ok(Some((snapshot, payload)))
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let id: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let metadata: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(Snapshot {
        id: SnapshotId(sql::parse_uuid(0, &id)?),
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        name: row.get(2)?,
        metadata: sql::parse_json(3, &metadata)?,
        memory_count: row.get::<_, i64>(4)? as usize,
        pattern_count: row.get::<_, i64>(5)? as usize,
        is_active: row.get(6)?,
        created_at: sql::parse_ts(7, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorStore;
    use crate::semantic::tests::{shared_conn, unit};
    use crate::semantic::MemoryStore;
    use serde_json::json;
    use sicc_types::config::MemorySettings;
    use sicc_types::memory::{ChunkType, MemoryFilter, NewMemoryChunk};
    use sicc_types::pattern::{NewBehaviorPattern, PatternFilter, PatternType, TriggerContext};
    use sicc_types::snapshot::{SNAPSHOT_TYPE_KEY, SNAPSHOT_TYPE_MANUAL};

    struct Fixture {
        memory: MemoryStore,
        behavior: BehaviorStore,
        snapshots: SnapshotStore,
    }

    fn setup() -> Fixture {
        let conn = shared_conn();
        Fixture {
            memory: MemoryStore::new(conn.clone(), &MemorySettings::default()),
            behavior: BehaviorStore::new(conn.clone()),
            snapshots: SnapshotStore::new(conn),
        }
    }

    fn active_contents(f: &Fixture, agent: AgentId) -> Vec<(String, u64)> {
        let mut rows: Vec<(String, u64)> = f
            .memory
            .list_by_agent(agent, &MemoryFilter::active(), 100)
            .unwrap()
            .into_iter()
            .map(|c| (c.content, c.usage_count))
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let f = setup();
        let agent = AgentId::new();
        let a = f
            .memory
            .create(NewMemoryChunk::new(agent, "c", "alpha", ChunkType::Faq, unit(0, 0.0)))
            .unwrap();
        let b = f
            .memory
            .create(NewMemoryChunk::new(agent, "c", "beta", ChunkType::Product, unit(1, 0.0)))
            .unwrap();
        f.memory.increment_usage(a).unwrap();
        f.memory.increment_usage(a).unwrap();
        let p = f
            .behavior
            .create(NewBehaviorPattern::new(
                agent,
                "c",
                "tone",
                PatternType::ToneAdjustment,
                TriggerContext::new(),
                json!({"tone": "warm"}),
            ))
            .unwrap();

        let mut meta = Metadata::new();
        meta.insert(SNAPSHOT_TYPE_KEY.into(), SNAPSHOT_TYPE_MANUAL.into());
        let snap = f.snapshots.create_snapshot(agent, "before", meta).unwrap();
        assert_eq!(snap.memory_count, 2);
        assert_eq!(snap.pattern_count, 1);
        assert_eq!(snap.kind(), Some(SNAPSHOT_TYPE_MANUAL));
        let before = active_contents(&f, agent);

        f.memory.delete(a).unwrap();
        f.memory.deactivate(b).unwrap();
        f.behavior.record_application(p, false).unwrap();
        f.memory
            .create(NewMemoryChunk::new(agent, "c", "gamma", ChunkType::Faq, unit(2, 0.0)))
            .unwrap();

        let report = f.snapshots.restore_snapshot(snap.id).unwrap();
        assert_eq!(report.memories_restored, 2);
        assert_eq!(report.memories_removed, 1);
        assert_eq!(active_contents(&f, agent), before);
        assert_eq!(f.memory.get(a).unwrap().usage_count, 2);
        assert!(f.memory.get(b).unwrap().is_active);
        let pattern = f.behavior.get(p).unwrap();
        assert_eq!(pattern.total_applications, 0);
        assert_eq!(
            f.behavior
                .list_by_agent(agent, &PatternFilter::active(), 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_get_list_delete() {
        let f = setup();
        let agent = AgentId::new();
        f.memory
            .create(NewMemoryChunk::new(agent, "c", "alpha", ChunkType::Faq, unit(0, 0.0)))
            .unwrap();
        let snap = f
            .snapshots
            .create_snapshot(agent, "one", Metadata::new())
            .unwrap();
        let (header, payload) = f.snapshots.get_snapshot(snap.id).unwrap();
        assert_eq!(header, snap);
        assert_eq!(payload.memories.len(), 1);
        assert_eq!(payload.memories[0].embedding.len(), unit(0, 0.0).len());

        assert_eq!(f.snapshots.list_snapshots(agent).unwrap().len(), 1);
        f.snapshots.delete_snapshot(snap.id).unwrap();
        assert!(matches!(
            f.snapshots.restore_snapshot(snap.id),
            Err(SiccError::NotFound { .. })
        ));
    }

    #[test]
    fn test_restore_leaves_other_agents_alone() {
        let f = setup();
        let agent = AgentId::new();
        let other = AgentId::new();
        f.memory
            .create(NewMemoryChunk::new(other, "c", "theirs", ChunkType::Faq, unit(0, 0.0)))
            .unwrap();
        let snap = f
            .snapshots
            .create_snapshot(agent, "empty", Metadata::new())
            .unwrap();
        f.snapshots.restore_snapshot(snap.id).unwrap();
        assert_eq!(active_contents(&f, other).len(), 1);
    }
}
