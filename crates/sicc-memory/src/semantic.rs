//! Memory chunk store with vector similarity search.
//!
//! Embeddings are stored as BLOBs in the `embedding` column of `memory_chunks`.
//! Search is an exact cosine ranking over the agent's active working set,
//! so recall against brute force is 1.0 by construction.

use crate::sql::{self, lock, storage};
use rusqlite::{Connection, Row};
use sicc_types::agent::AgentId;
use sicc_types::config::MemorySettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::{
    layer_of, meta_keys, set_layer, validate_layer_metadata, Layer, MemoryChunk, MemoryFilter,
    MemoryId, Metadata, NewMemoryChunk, ScoredChunk, EMBEDDING_DIM,
};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub(crate) const CHUNK_COLUMNS: &str = "id, agent_id, client_id, content, chunk_type, embedding, \
     metadata, source, usage_count, confidence_score, is_active, created_at";

/// Memory chunk store backed by SQLite.
#[derive(Clone)]
pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
    max_content_bytes: usize,
    quota: u64,
    prune_tx: Option<UnboundedSender<AgentId>>,
}

impl MemoryStore {
    /// Create a new memory store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>, settings: &MemorySettings) -> Self {
        Self {
            conn,
            max_content_bytes: settings.max_content_bytes,
            quota: settings.agent_memory_quota,
            prune_tx: None,
        }
    }

    /// Send the agent id to `tx` whenever a create pushes it over quota.
    pub fn with_prune_notifier(mut self, tx: UnboundedSender<AgentId>) -> Self {
        self.prune_tx = Some(tx);
        self
    }

    /// Configured soft quota of active chunks per agent.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Store a new memory chunk.
    ///
    /// Exceeding the agent quota does not fail the call; it logs a
    /// `quota_soft` warning and queues the agent for pruning.
    pub fn create(&self, chunk: NewMemoryChunk) -> SiccResult<MemoryId> {
        let agent_id = chunk.agent_id;
        let id = {
            let conn = lock(&self.conn)?;
            let chunk = prepare_chunk(&conn, chunk, self.max_content_bytes)?;
            insert_chunk(&conn, &chunk)?;
            chunk.id
        };
        debug!(agent_id = %agent_id, memory_id = %id, "Stored memory chunk");
        self.check_quota(agent_id)?;
        Ok(id)
    }

    /// Log and queue a prune when the agent is over quota. Returns whether it was.
    pub fn check_quota(&self, agent_id: AgentId) -> SiccResult<bool> {
        let active = self.count_active(agent_id)?;
        if active <= self.quota {
            return Ok(false);
        }
        let soft = SiccError::QuotaSoft {
            agent_id: agent_id.to_string(),
            active,
            quota: self.quota,
        };
        warn!(agent_id = %agent_id, kind = soft.kind(), "{soft}");
        if let Some(tx) = &self.prune_tx {
            let _ = tx.send(agent_id);
        }
        Ok(true)
    }

    /// Fetch a chunk by id.
    pub fn get(&self, id: MemoryId) -> SiccResult<MemoryChunk> {
        let conn = lock(&self.conn)?;
        get_chunk(&conn, id)?.ok_or_else(|| SiccError::not_found("memory chunk", id))
    }

    /// Hard-delete a chunk.
    pub fn delete(&self, id: MemoryId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "DELETE FROM memory_chunks WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("memory chunk", id));
        }
        Ok(())
    }

    /// Soft-delete a chunk: it stays listed but no longer matches searches.
    pub fn deactivate(&self, id: MemoryId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE memory_chunks SET is_active = 0 WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("memory chunk", id));
        }
        Ok(())
    }

    /// Merge `patch` into the chunk's metadata. A `null` value removes the key.
    ///
    /// The merged map is validated like a new chunk's before anything is written.
    pub fn update_metadata(&self, id: MemoryId, patch: Metadata) -> SiccResult<MemoryChunk> {
        let conn = lock(&self.conn)?;
        let mut chunk =
            get_chunk(&conn, id)?.ok_or_else(|| SiccError::not_found("memory chunk", id))?;
        let layer = merge_metadata(&conn, &mut chunk.metadata, patch)?;
        conn.execute(
            "UPDATE memory_chunks SET metadata = ?1, layer = ?2, company_id = ?3, version_id = ?4
             WHERE id = ?5",
            rusqlite::params![
                sql::to_json(&chunk.metadata)?,
                layer.as_str(),
                chunk.company_id(),
                chunk.version_id(),
                id.0.to_string(),
            ],
        )
        .map_err(storage)?;
        Ok(chunk)
    }

    /// List an agent's chunks, newest first.
    pub fn list_by_agent(
        &self,
        agent_id: AgentId,
        filter: &MemoryFilter,
        limit: usize,
    ) -> SiccResult<Vec<MemoryChunk>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = lock(&self.conn)?;
        let mut sql = format!("SELECT {CHUNK_COLUMNS} FROM memory_chunks WHERE agent_id = ?1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(agent_id.0.to_string())];

        if let Some(active) = filter.is_active {
            params.push(Box::new(active));
            sql.push_str(&format!(" AND is_active = ?{}", params.len()));
        }
        if let Some(chunk_type) = filter.chunk_type {
            params.push(Box::new(chunk_type.as_str()));
            sql.push_str(&format!(" AND chunk_type = ?{}", params.len()));
        }
        if let Some(layer) = filter.layer {
            params.push(Box::new(layer.as_str()));
            sql.push_str(&format!(" AND layer = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql).map_err(storage)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), chunk_from_row)
            .map_err(storage)?;

        let mut chunks = Vec::new();
        for row in rows {
            let chunk = row.map_err(storage)?;
            if metadata_matches(&chunk.metadata, &filter.metadata) {
                chunks.push(chunk);
                if chunks.len() >= limit {
                    break;
                }
            }
        }
        Ok(chunks)
    }

    /// Rank the agent's active chunks by cosine similarity to `query`.
    ///
    /// Results are descending by similarity (ties: newer first, then higher
    /// confidence), filtered by `similarity >= min_similarity` and capped at `limit`.
    pub fn search(
        &self,
        agent_id: AgentId,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> SiccResult<Vec<ScoredChunk>> {
        if query.len() != EMBEDDING_DIM {
            return Err(SiccError::Validation(format!(
                "query embedding has {} dimensions, expected {EMBEDDING_DIM}",
                query.len()
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = {
            let conn = lock(&self.conn)?;
            load_active_chunks(&conn, agent_id)?
        };
        let scanned = candidates.len();

        let mut scored: Vec<ScoredChunk> = candidates
            .into_iter()
            .map(|chunk| {
                let similarity = cosine_similarity(query, &chunk.embedding);
                ScoredChunk { chunk, similarity }
            })
            .filter(|s| s.similarity >= min_similarity)
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
                .then_with(|| {
                    b.chunk
                        .confidence_score
                        .partial_cmp(&a.chunk.confidence_score)
                        .unwrap_or(Ordering::Equal)
                })
        });
        scored.truncate(limit);
        debug!(
            agent_id = %agent_id,
            "Vector search: {} results from {} candidates",
            scored.len(),
            scanned
        );
        Ok(scored)
    }

    /// Atomically add one to a chunk's usage counter.
    pub fn increment_usage(&self, id: MemoryId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE memory_chunks SET usage_count = usage_count + 1 WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("memory chunk", id));
        }
        Ok(())
    }

    /// An active chunk of the agent whose normalized content equals `content`.
    pub fn find_duplicate(&self, agent_id: AgentId, content: &str) -> SiccResult<Option<MemoryId>> {
        let conn = lock(&self.conn)?;
        find_active_duplicate(&conn, agent_id, &sql::content_hash(content))
    }

    /// Number of active chunks for the agent.
    pub fn count_active(&self, agent_id: AgentId) -> SiccResult<u64> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_chunks WHERE agent_id = ?1 AND is_active = 1",
                rusqlite::params![agent_id.0.to_string()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(count as u64)
    }

    /// Lowercased contents of the agent's active chunks.
    pub fn active_contents(&self, agent_id: AgentId) -> SiccResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT content FROM memory_chunks WHERE agent_id = ?1 AND is_active = 1")
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.0.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage)?;
        let mut contents = Vec::new();
        for row in rows {
            contents.push(sicc_types::memory::normalize_content(&row.map_err(storage)?));
        }
        Ok(contents)
    }
}

/// Validate a new chunk and turn it into a row ready to insert.
pub(crate) fn prepare_chunk(
    conn: &Connection,
    new: NewMemoryChunk,
    max_content_bytes: usize,
) -> SiccResult<MemoryChunk> {
    if new.embedding.len() != EMBEDDING_DIM {
        return Err(SiccError::Validation(format!(
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            new.embedding.len()
        )));
    }
    if new.embedding.iter().any(|v| !v.is_finite()) {
        return Err(SiccError::Validation("embedding contains non-finite values".into()));
    }
    if new.content.trim().is_empty() {
        return Err(SiccError::Validation("content must not be empty".into()));
    }
    if new.content.len() > max_content_bytes {
        return Err(SiccError::Validation(format!(
            "content is {} bytes, limit is {max_content_bytes}",
            new.content.len()
        )));
    }
    if !(0.0..=1.0).contains(&new.confidence_score) {
        return Err(SiccError::Validation(format!(
            "confidence_score {} outside [0, 1]",
            new.confidence_score
        )));
    }
    let mut metadata = new.metadata;
    let layer = checked_layer(conn, &metadata)?;
    set_layer(&mut metadata, layer);

    Ok(MemoryChunk {
        id: MemoryId::new(),
        agent_id: new.agent_id,
        client_id: new.client_id,
        content: new.content,
        chunk_type: new.chunk_type,
        embedding: new.embedding,
        metadata,
        source: new.source,
        usage_count: 0,
        confidence_score: new.confidence_score,
        is_active: true,
        created_at: sql::now_utc(),
    })
}

/// Validate the reserved layer keys, including that a base-layer
/// `version_id` names an existing niche version.
pub(crate) fn checked_layer(conn: &Connection, metadata: &Metadata) -> SiccResult<Layer> {
    let layer = validate_layer_metadata(metadata).map_err(SiccError::Validation)?;
    if layer == Layer::Base {
        let version_id = metadata
            .get(meta_keys::VERSION_ID)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !sql::version_exists(conn, version_id)? {
            return Err(SiccError::Validation(format!(
                "version_id '{version_id}' does not refer to a niche version"
            )));
        }
    }
    Ok(layer)
}

/// Apply a metadata patch in place and return the validated layer.
pub(crate) fn merge_metadata(
    conn: &Connection,
    metadata: &mut Metadata,
    patch: Metadata,
) -> SiccResult<Layer> {
    let mut merged = metadata.clone();
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(&key);
        } else {
            merged.insert(key, value);
        }
    }
    let layer = checked_layer(conn, &merged)?;
    set_layer(&mut merged, layer);
    *metadata = merged;
    Ok(layer)
}

/// Insert (or overwrite by id) a full chunk row.
pub(crate) fn insert_chunk(conn: &Connection, chunk: &MemoryChunk) -> SiccResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO memory_chunks (id, agent_id, client_id, content, content_hash,
            chunk_type, embedding, metadata, layer, company_id, version_id, source,
            confidence_score, usage_count, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            chunk.id.0.to_string(),
            chunk.agent_id.0.to_string(),
            chunk.client_id,
            chunk.content,
            sql::content_hash(&chunk.content),
            chunk.chunk_type.as_str(),
            sql::embedding_to_bytes(&chunk.embedding),
            sql::to_json(&chunk.metadata)?,
            layer_of(&chunk.metadata).as_str(),
            chunk.company_id(),
            chunk.version_id(),
            chunk.source.as_str(),
            chunk.confidence_score as f64,
            chunk.usage_count as i64,
            chunk.is_active,
            sql::ts(&chunk.created_at),
        ],
    )
    .map_err(storage)?;
    Ok(())
}

pub(crate) fn get_chunk(conn: &Connection, id: MemoryId) -> SiccResult<Option<MemoryChunk>> {
    let result = conn.query_row(
        &format!("SELECT {CHUNK_COLUMNS} FROM memory_chunks WHERE id = ?1"),
        rusqlite::params![id.0.to_string()],
        chunk_from_row,
    );
    match result {
        Ok(chunk) => Ok(Some(chunk)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

pub(crate) fn load_active_chunks(
    conn: &Connection,
    agent_id: AgentId,
) -> SiccResult<Vec<MemoryChunk>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM memory_chunks
             WHERE agent_id = ?1 AND is_active = 1 ORDER BY created_at"
        ))
        .map_err(storage)?;
    let rows = stmt
        .query_map(rusqlite::params![agent_id.0.to_string()], chunk_from_row)
        .map_err(storage)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(storage)
}

pub(crate) fn find_active_duplicate(
    conn: &Connection,
    agent_id: AgentId,
    hash: &str,
) -> SiccResult<Option<MemoryId>> {
    let result = conn.query_row(
        "SELECT id FROM memory_chunks
         WHERE agent_id = ?1 AND content_hash = ?2 AND is_active = 1 LIMIT 1",
        rusqlite::params![agent_id.0.to_string(), hash],
        |row| {
            let raw: String = row.get(0)?;
            sql::parse_uuid(0, &raw).map(MemoryId)
        },
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

/// Delete every chunk of the agent installed by `version_id`.
pub(crate) fn delete_by_version(
    conn: &Connection,
    agent_id: AgentId,
    version_id: &str,
) -> SiccResult<usize> {
    conn.execute(
        "DELETE FROM memory_chunks WHERE agent_id = ?1 AND version_id = ?2",
        rusqlite::params![agent_id.0.to_string(), version_id],
    )
    .map_err(storage)
}

pub(crate) fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryChunk> {
    let id: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let chunk_type: String = row.get(4)?;
    let embedding: Vec<u8> = row.get(5)?;
    let metadata: String = row.get(6)?;
    let source: String = row.get(7)?;
    let usage_count: i64 = row.get(8)?;
    let confidence: f64 = row.get(9)?;
    let created_at: String = row.get(11)?;
    Ok(MemoryChunk {
        id: MemoryId(sql::parse_uuid(0, &id)?),
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        client_id: row.get(2)?,
        content: row.get(3)?,
        chunk_type: sql::parse_label(4, &chunk_type)?,
        embedding: sql::embedding_from_bytes(&embedding),
        metadata: sql::parse_json(6, &metadata)?,
        source: sql::parse_label(7, &source)?,
        usage_count: usage_count.max(0) as u64,
        confidence_score: confidence as f32,
        is_active: row.get(10)?,
        created_at: sql::parse_ts(11, &created_at)?,
    })
}

/// Every filter key is present in `metadata` with an equal value.
pub(crate) fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use sicc_types::memory::{ChunkType, MemorySource};

    /// A unit vector along `axis`, optionally tilted towards `axis + 1`.
    pub(crate) fn unit(axis: usize, tilt: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v[(axis + 1) % EMBEDDING_DIM] = tilt;
        let norm = (1.0 + tilt * tilt).sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    pub(crate) fn shared_conn() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn setup() -> MemoryStore {
        MemoryStore::new(shared_conn(), &MemorySettings::default())
    }

    fn chunk(agent: AgentId, content: &str, embedding: Vec<f32>) -> NewMemoryChunk {
        NewMemoryChunk::new(agent, "client-1", content, ChunkType::Faq, embedding)
    }

    #[test]
    fn test_create_and_get() {
        let store = setup();
        let agent = AgentId::new();
        let new = chunk(agent, "What is SICC? It is a learning loop.", unit(0, 0.0))
            .with_source(MemorySource::Conversation)
            .with_confidence(0.9);
        let id = store.create(new.clone()).unwrap();

        let got = store.get(id).unwrap();
        assert_eq!(got.content, new.content);
        assert_eq!(got.chunk_type, ChunkType::Faq);
        assert_eq!(got.embedding, new.embedding);
        assert_eq!(got.source, MemorySource::Conversation);
        assert!((got.confidence_score - 0.9).abs() < 1e-6);
        assert_eq!(got.usage_count, 0);
        assert!(got.is_active);
        assert_eq!(got.layer(), Layer::Individual);
        assert_eq!(got.metadata[meta_keys::PRIORITY], 3);
    }

    #[test]
    fn test_create_rejects_wrong_dimension() {
        let store = setup();
        let err = store
            .create(chunk(AgentId::new(), "short", vec![0.1, 0.2]))
            .unwrap_err();
        assert!(matches!(err, SiccError::Validation(_)));
    }

    #[test]
    fn test_create_rejects_oversized_content() {
        let store = MemoryStore::new(
            shared_conn(),
            &MemorySettings {
                max_content_bytes: 8,
                agent_memory_quota: 10,
            },
        );
        let err = store
            .create(chunk(AgentId::new(), "far too long for eight", unit(0, 0.0)))
            .unwrap_err();
        assert!(matches!(err, SiccError::Validation(_)));
    }

    #[test]
    fn test_company_layer_requires_company_id() {
        let store = setup();
        let new = chunk(AgentId::new(), "x", unit(0, 0.0)).with_layer(Layer::Company);
        assert!(matches!(store.create(new), Err(SiccError::Validation(_))));
    }

    #[test]
    fn test_base_layer_requires_existing_version() {
        let store = setup();
        let new = chunk(AgentId::new(), "x", unit(0, 0.0)).with_version("missing");
        assert!(matches!(store.create(new), Err(SiccError::Validation(_))));
    }

    #[test]
    fn test_search_orders_and_filters() {
        let store = setup();
        let agent = AgentId::new();
        store.create(chunk(agent, "exact", unit(0, 0.0))).unwrap();
        store.create(chunk(agent, "close", unit(0, 0.3))).unwrap();
        store.create(chunk(agent, "far", unit(5, 0.0))).unwrap();
        store
            .create(chunk(AgentId::new(), "other agent", unit(0, 0.0)))
            .unwrap();

        let results = store.search(agent, &unit(0, 0.0), 5, 0.5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "exact");
        assert_eq!(results[1].chunk.content, "close");
        assert!(results[0].similarity >= results[1].similarity);

        let capped = store.search(agent, &unit(0, 0.0), 1, 0.0).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_search_min_similarity_one_without_identical_vector() {
        let store = setup();
        let agent = AgentId::new();
        store.create(chunk(agent, "close", unit(0, 0.3))).unwrap();
        let results = store.search(agent, &unit(0, 0.0), 5, 1.0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_search_ties_prefer_newer() {
        let store = setup();
        let agent = AgentId::new();
        store.create(chunk(agent, "older", unit(0, 0.0))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.create(chunk(agent, "newer", unit(0, 0.0))).unwrap();
        let results = store.search(agent, &unit(0, 0.0), 2, 0.0).unwrap();
        assert_eq!(results[0].chunk.content, "newer");
    }

    #[test]
    fn test_deactivated_chunks_not_searched() {
        let store = setup();
        let agent = AgentId::new();
        let id = store.create(chunk(agent, "hidden", unit(0, 0.0))).unwrap();
        store.deactivate(id).unwrap();
        assert!(store.search(agent, &unit(0, 0.0), 5, 0.0).unwrap().is_empty());
        assert!(!store.get(id).unwrap().is_active);
    }

    #[test]
    fn test_increment_usage() {
        let store = setup();
        let id = store
            .create(chunk(AgentId::new(), "used", unit(0, 0.0)))
            .unwrap();
        store.increment_usage(id).unwrap();
        store.increment_usage(id).unwrap();
        assert_eq!(store.get(id).unwrap().usage_count, 2);
        assert!(matches!(
            store.increment_usage(MemoryId::new()),
            Err(SiccError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_by_agent_filters() {
        let store = setup();
        let agent = AgentId::new();
        store.create(chunk(agent, "faq one", unit(0, 0.0))).unwrap();
        let mut term = NewMemoryChunk::new(
            agent,
            "client-1",
            "plano premium",
            ChunkType::BusinessTerm,
            unit(1, 0.0),
        );
        term.metadata.insert("topic".into(), "pricing".into());
        store.create(term).unwrap();
        store
            .create(chunk(agent, "acme only", unit(2, 0.0)).with_company("acme"))
            .unwrap();

        let all = store.list_by_agent(agent, &MemoryFilter::default(), 10).unwrap();
        assert_eq!(all.len(), 3);

        let terms = store
            .list_by_agent(
                agent,
                &MemoryFilter {
                    chunk_type: Some(ChunkType::BusinessTerm),
                    ..Default::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(terms.len(), 1);

        let mut by_meta = MemoryFilter::active();
        by_meta.metadata.insert("topic".into(), "pricing".into());
        assert_eq!(store.list_by_agent(agent, &by_meta, 10).unwrap().len(), 1);

        let company = MemoryFilter {
            layer: Some(Layer::Company),
            ..Default::default()
        };
        let rows = store.list_by_agent(agent, &company, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].company_id(), Some("acme"));

        assert_eq!(store.list_by_agent(agent, &MemoryFilter::default(), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_update_metadata_merges_and_validates() {
        let store = setup();
        let id = store
            .create(chunk(AgentId::new(), "tagged", unit(0, 0.0)))
            .unwrap();

        let mut patch = Metadata::new();
        patch.insert("topic".into(), "billing".into());
        let updated = store.update_metadata(id, patch).unwrap();
        assert_eq!(updated.metadata["topic"], "billing");

        let mut bad = Metadata::new();
        bad.insert(meta_keys::LAYER.into(), "company".into());
        assert!(matches!(
            store.update_metadata(id, bad),
            Err(SiccError::Validation(_))
        ));

        let mut remove = Metadata::new();
        remove.insert("topic".into(), serde_json::Value::Null);
        let updated = store.update_metadata(id, remove).unwrap();
        assert!(!updated.metadata.contains_key("topic"));
        assert_eq!(store.get(id).unwrap().metadata, updated.metadata);
    }

    #[test]
    fn test_find_duplicate_normalizes() {
        let store = setup();
        let agent = AgentId::new();
        let id = store
            .create(chunk(agent, "Plano Premium", unit(0, 0.0)))
            .unwrap();
        assert_eq!(store.find_duplicate(agent, "  plano   premium").unwrap(), Some(id));
        assert_eq!(store.find_duplicate(agent, "plano pro").unwrap(), None);
    }

    #[test]
    fn test_quota_soft_notifies_without_failing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = MemoryStore::new(
            shared_conn(),
            &MemorySettings {
                max_content_bytes: 2048,
                agent_memory_quota: 1,
            },
        )
        .with_prune_notifier(tx);
        let agent = AgentId::new();
        store.create(chunk(agent, "first", unit(0, 0.0))).unwrap();
        assert!(rx.try_recv().is_err());
        store.create(chunk(agent, "second", unit(1, 0.0))).unwrap();
        assert_eq!(rx.try_recv().unwrap(), agent);
        assert_eq!(store.count_active(agent).unwrap(), 2);
    }

    #[test]
    fn test_delete() {
        let store = setup();
        let id = store
            .create(chunk(AgentId::new(), "gone", unit(0, 0.0)))
            .unwrap();
        store.delete(id).unwrap();
        assert!(matches!(store.get(id), Err(SiccError::NotFound { .. })));
        assert!(matches!(store.delete(id), Err(SiccError::NotFound { .. })));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
