//! Behavior pattern store with trigger matching and success tracking.

use crate::semantic::{checked_layer, merge_metadata, metadata_matches};
use crate::sql::{self, lock, storage};
use rusqlite::{Connection, Row};
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::{layer_of, set_layer, Layer, Metadata};
use sicc_types::pattern::{
    success_rate, BehaviorPattern, NewBehaviorPattern, PatternFilter, PatternId, RuntimeContext,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub(crate) const PATTERN_COLUMNS: &str = "id, agent_id, client_id, pattern_name, pattern_type, \
     trigger_context, action_config, total_applications, successful_applications, success_rate, \
     metadata, is_active, created_at";

/// Behavior pattern store backed by SQLite.
#[derive(Clone)]
pub struct BehaviorStore {
    conn: Arc<Mutex<Connection>>,
}

impl BehaviorStore {
    /// Create a new behavior store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Store a new pattern.
    ///
    /// Fails with `Conflict` when an active pattern with the same name
    /// already exists in the same layer for the agent.
    pub fn create(&self, pattern: NewBehaviorPattern) -> SiccResult<PatternId> {
        let conn = lock(&self.conn)?;
        let pattern = prepare_pattern(&conn, pattern)?;
        if find_active_by_name(&conn, pattern.agent_id, pattern.layer(), &pattern.pattern_name)?
            .is_some()
        {
            return Err(SiccError::Conflict(format!(
                "pattern '{}' already exists in the {} layer",
                pattern.pattern_name,
                pattern.layer()
            )));
        }
        insert_pattern(&conn, &pattern)?;
        debug!(agent_id = %pattern.agent_id, pattern = %pattern.pattern_name, "Stored behavior pattern");
        Ok(pattern.id)
    }

    /// Fetch a pattern by id.
    pub fn get(&self, id: PatternId) -> SiccResult<BehaviorPattern> {
        let conn = lock(&self.conn)?;
        get_pattern(&conn, id)?.ok_or_else(|| SiccError::not_found("behavior pattern", id))
    }

    /// Hard-delete a pattern.
    pub fn delete(&self, id: PatternId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "DELETE FROM behavior_patterns WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("behavior pattern", id));
        }
        Ok(())
    }

    /// Soft-delete a pattern so it is never applied again.
    pub fn deactivate(&self, id: PatternId) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE behavior_patterns SET is_active = 0 WHERE id = ?1",
                rusqlite::params![id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("behavior pattern", id));
        }
        Ok(())
    }

    /// Merge `patch` into the pattern's metadata. A `null` value removes the key.
    pub fn update_metadata(&self, id: PatternId, patch: Metadata) -> SiccResult<BehaviorPattern> {
        let conn = lock(&self.conn)?;
        let mut pattern =
            get_pattern(&conn, id)?.ok_or_else(|| SiccError::not_found("behavior pattern", id))?;
        let before = pattern.layer();
        let layer = merge_metadata(&conn, &mut pattern.metadata, patch)?;
        if layer != before
            && pattern.is_active
            && find_active_by_name(&conn, pattern.agent_id, layer, &pattern.pattern_name)?
                .is_some()
        {
            return Err(SiccError::Conflict(format!(
                "pattern '{}' already exists in the {layer} layer",
                pattern.pattern_name
            )));
        }
        conn.execute(
            "UPDATE behavior_patterns SET metadata = ?1, layer = ?2, company_id = ?3, version_id = ?4
             WHERE id = ?5",
            rusqlite::params![
                sql::to_json(&pattern.metadata)?,
                layer.as_str(),
                pattern.company_id(),
                pattern.version_id(),
                id.0.to_string(),
            ],
        )
        .map_err(storage)?;
        Ok(pattern)
    }

    /// List an agent's patterns, best success rate first.
    pub fn list_by_agent(
        &self,
        agent_id: AgentId,
        filter: &PatternFilter,
        limit: usize,
    ) -> SiccResult<Vec<BehaviorPattern>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = lock(&self.conn)?;
        let mut sql =
            format!("SELECT {PATTERN_COLUMNS} FROM behavior_patterns WHERE agent_id = ?1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(agent_id.0.to_string())];

        if let Some(active) = filter.is_active {
            params.push(Box::new(active));
            sql.push_str(&format!(" AND is_active = ?{}", params.len()));
        }
        if let Some(pattern_type) = filter.pattern_type {
            params.push(Box::new(pattern_type.as_str()));
            sql.push_str(&format!(" AND pattern_type = ?{}", params.len()));
        }
        if let Some(layer) = filter.layer {
            params.push(Box::new(layer.as_str()));
            sql.push_str(&format!(" AND layer = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY success_rate DESC, total_applications DESC, created_at");

        let mut stmt = conn.prepare(&sql).map_err(storage)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), pattern_from_row)
            .map_err(storage)?;

        let mut patterns = Vec::new();
        for row in rows {
            let pattern = row.map_err(storage)?;
            if metadata_matches(&pattern.metadata, &filter.metadata) {
                patterns.push(pattern);
                if patterns.len() >= limit {
                    break;
                }
            }
        }
        Ok(patterns)
    }

    /// Active patterns whose trigger is satisfied by `context`, ordered by
    /// success rate then number of applications (both descending).
    pub fn get_applicable(
        &self,
        agent_id: AgentId,
        context: &RuntimeContext,
    ) -> SiccResult<Vec<BehaviorPattern>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PATTERN_COLUMNS} FROM behavior_patterns
                 WHERE agent_id = ?1 AND is_active = 1
                 ORDER BY success_rate DESC, total_applications DESC, created_at"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.0.to_string()], pattern_from_row)
            .map_err(storage)?;

        let mut applicable = Vec::new();
        for row in rows {
            let pattern = row.map_err(storage)?;
            if pattern.matches(context) {
                applicable.push(pattern);
            }
        }
        Ok(applicable)
    }

    /// Record one application of the pattern.
    ///
    /// A single UPDATE bumps both counters and recomputes the rate, so
    /// concurrent callers never lose increments and `successful <= total` holds.
    pub fn record_application(&self, id: PatternId, succeeded: bool) -> SiccResult<BehaviorPattern> {
        let conn = lock(&self.conn)?;
        let success = i64::from(succeeded);
        let n = conn
            .execute(
                "UPDATE behavior_patterns SET
                    total_applications = total_applications + 1,
                    successful_applications = successful_applications + ?1,
                    success_rate = CAST(successful_applications + ?1 AS REAL) / (total_applications + 1)
                 WHERE id = ?2",
                rusqlite::params![success, id.0.to_string()],
            )
            .map_err(storage)?;
        if n == 0 {
            return Err(SiccError::not_found("behavior pattern", id));
        }
        get_pattern(&conn, id)?.ok_or_else(|| SiccError::not_found("behavior pattern", id))
    }

    /// The active pattern with `name` in `layer`, if any.
    pub fn find_by_name(
        &self,
        agent_id: AgentId,
        layer: Layer,
        name: &str,
    ) -> SiccResult<Option<BehaviorPattern>> {
        let conn = lock(&self.conn)?;
        find_active_by_name(&conn, agent_id, layer, name)
    }
}

/// Validate a new pattern and turn it into a row ready to insert.
pub(crate) fn prepare_pattern(
    conn: &Connection,
    new: NewBehaviorPattern,
) -> SiccResult<BehaviorPattern> {
    if new.pattern_name.trim().is_empty() {
        return Err(SiccError::Validation("pattern_name must not be empty".into()));
    }
    if new.successful_applications > new.total_applications {
        return Err(SiccError::Validation(format!(
            "successful_applications ({}) exceeds total_applications ({})",
            new.successful_applications, new.total_applications
        )));
    }
    let mut metadata = new.metadata;
    let layer = checked_layer(conn, &metadata)?;
    set_layer(&mut metadata, layer);

    Ok(BehaviorPattern {
        id: PatternId::new(),
        agent_id: new.agent_id,
        client_id: new.client_id,
        pattern_name: new.pattern_name,
        pattern_type: new.pattern_type,
        trigger_context: new.trigger_context,
        action_config: new.action_config,
        total_applications: new.total_applications,
        successful_applications: new.successful_applications,
        success_rate: success_rate(new.total_applications, new.successful_applications),
        metadata,
        is_active: true,
        created_at: sql::now_utc(),
    })
}

/// Insert (or overwrite by id) a full pattern row.
pub(crate) fn insert_pattern(conn: &Connection, pattern: &BehaviorPattern) -> SiccResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO behavior_patterns (id, agent_id, client_id, pattern_name,
            pattern_type, trigger_context, action_config, total_applications,
            successful_applications, success_rate, metadata, layer, company_id, version_id,
            is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            pattern.id.0.to_string(),
            pattern.agent_id.0.to_string(),
            pattern.client_id,
            pattern.pattern_name,
            pattern.pattern_type.as_str(),
            sql::to_json(&pattern.trigger_context)?,
            sql::to_json(&pattern.action_config)?,
            pattern.total_applications as i64,
            pattern.successful_applications as i64,
            pattern.success_rate,
            sql::to_json(&pattern.metadata)?,
            layer_of(&pattern.metadata).as_str(),
            pattern.company_id(),
            pattern.version_id(),
            pattern.is_active,
            sql::ts(&pattern.created_at),
        ],
    )
    .map_err(storage)?;
    Ok(())
}

pub(crate) fn get_pattern(conn: &Connection, id: PatternId) -> SiccResult<Option<BehaviorPattern>> {
    let result = conn.query_row(
        &format!("SELECT {PATTERN_COLUMNS} FROM behavior_patterns WHERE id = ?1"),
        rusqlite::params![id.0.to_string()],
        pattern_from_row,
    );
    match result {
        Ok(pattern) => Ok(Some(pattern)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

pub(crate) fn find_active_by_name(
    conn: &Connection,
    agent_id: AgentId,
    layer: Layer,
    name: &str,
) -> SiccResult<Option<BehaviorPattern>> {
    let result = conn.query_row(
        &format!(
            "SELECT {PATTERN_COLUMNS} FROM behavior_patterns
             WHERE agent_id = ?1 AND layer = ?2 AND pattern_name = ?3 AND is_active = 1"
        ),
        rusqlite::params![agent_id.0.to_string(), layer.as_str(), name],
        pattern_from_row,
    );
    match result {
        Ok(pattern) => Ok(Some(pattern)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

pub(crate) fn load_active_patterns(
    conn: &Connection,
    agent_id: AgentId,
) -> SiccResult<Vec<BehaviorPattern>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM behavior_patterns
             WHERE agent_id = ?1 AND is_active = 1 ORDER BY created_at"
        ))
        .map_err(storage)?;
    let rows = stmt
        .query_map(rusqlite::params![agent_id.0.to_string()], pattern_from_row)
        .map_err(storage)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(storage)
}

/// Delete every pattern of the agent installed by `version_id`.
pub(crate) fn delete_by_version(
    conn: &Connection,
    agent_id: AgentId,
    version_id: &str,
) -> SiccResult<usize> {
    conn.execute(
        "DELETE FROM behavior_patterns WHERE agent_id = ?1 AND version_id = ?2",
        rusqlite::params![agent_id.0.to_string(), version_id],
    )
    .map_err(storage)
}

pub(crate) fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<BehaviorPattern> {
    let id: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let pattern_type: String = row.get(4)?;
    let trigger: String = row.get(5)?;
    let action: String = row.get(6)?;
    let total: i64 = row.get(7)?;
    let successful: i64 = row.get(8)?;
    let metadata: String = row.get(10)?;
    let created_at: String = row.get(12)?;
    Ok(BehaviorPattern {
        id: PatternId(sql::parse_uuid(0, &id)?),
        agent_id: AgentId(sql::parse_uuid(1, &agent)?),
        client_id: row.get(2)?,
        pattern_name: row.get(3)?,
        pattern_type: sql::parse_label(4, &pattern_type)?,
        trigger_context: sql::parse_json(5, &trigger)?,
        action_config: sql::parse_json(6, &action)?,
        total_applications: total.max(0) as u64,
        successful_applications: successful.max(0) as u64,
        success_rate: row.get(9)?,
        metadata: sql::parse_json(10, &metadata)?,
        is_active: row.get(11)?,
        created_at: sql::parse_ts(12, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::tests::shared_conn;
    use serde_json::json;
    use sicc_types::pattern::{PatternType, TriggerContext};

    fn setup() -> BehaviorStore {
        BehaviorStore::new(shared_conn())
    }

    fn trigger(message_type: &str) -> TriggerContext {
        TriggerContext::from([("message_type".to_string(), json!(message_type))])
    }

    fn greet(agent: AgentId) -> NewBehaviorPattern {
        NewBehaviorPattern::new(
            agent,
            "client-1",
            "greet",
            PatternType::ResponseStrategy,
            trigger("greeting"),
            json!({"template": "Hi!"}),
        )
        .with_history(10, 9)
    }

    #[test]
    fn test_applicable_and_record_application() {
        let store = setup();
        let agent = AgentId::new();
        let id = store.create(greet(agent)).unwrap();

        let hits = store
            .get_applicable(agent, &RuntimeContext::from([("message_type".to_string(), json!("greeting"))]))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!((hits[0].success_rate - 0.9).abs() < 1e-9);

        let misses = store
            .get_applicable(agent, &RuntimeContext::from([("message_type".to_string(), json!("question"))]))
            .unwrap();
        assert!(misses.is_empty());

        let updated = store.record_application(id, true).unwrap();
        assert_eq!(updated.total_applications, 11);
        assert_eq!(updated.successful_applications, 10);
        assert!((updated.success_rate - 10.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_application_counts() {
        let store = setup();
        let id = store.create(greet(AgentId::new())).unwrap();
        for i in 0..6 {
            store.record_application(id, i % 2 == 0).unwrap();
        }
        let p = store.get(id).unwrap();
        assert_eq!(p.total_applications, 16);
        assert_eq!(p.successful_applications, 12);
        assert!(p.successful_applications <= p.total_applications);
    }

    #[test]
    fn test_concurrent_record_application_loses_nothing() {
        let store = setup();
        let id = store.create(greet(AgentId::new())).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.record_application(id, true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let p = store.get(id).unwrap();
        assert_eq!(p.total_applications, 210);
        assert_eq!(p.successful_applications, 209);
    }

    #[test]
    fn test_ordering_by_rate_then_total() {
        let store = setup();
        let agent = AgentId::new();
        let mk = |name: &str, total, ok| {
            NewBehaviorPattern::new(
                agent,
                "c",
                name,
                PatternType::ToneAdjustment,
                TriggerContext::new(),
                json!({"tone": name}),
            )
            .with_history(total, ok)
        };
        store.create(mk("half", 10, 5)).unwrap();
        store.create(mk("best-small", 2, 2)).unwrap();
        store.create(mk("best-large", 20, 20)).unwrap();
        let names: Vec<String> = store
            .get_applicable(agent, &RuntimeContext::new())
            .unwrap()
            .into_iter()
            .map(|p| p.pattern_name)
            .collect();
        assert_eq!(names, vec!["best-large", "best-small", "half"]);
    }

    #[test]
    fn test_duplicate_name_in_layer_conflicts() {
        let store = setup();
        let agent = AgentId::new();
        store.create(greet(agent)).unwrap();
        assert!(matches!(store.create(greet(agent)), Err(SiccError::Conflict(_))));
        // Same name in another layer is allowed.
        store.create(greet(agent).with_company("acme")).unwrap();
    }

    #[test]
    fn test_successful_exceeding_total_rejected() {
        let store = setup();
        let bad = greet(AgentId::new()).with_history(1, 2);
        assert!(matches!(store.create(bad), Err(SiccError::Validation(_))));
    }

    #[test]
    fn test_inactive_patterns_not_applicable() {
        let store = setup();
        let agent = AgentId::new();
        let id = store.create(greet(agent)).unwrap();
        store.deactivate(id).unwrap();
        let ctx = RuntimeContext::from([("message_type".to_string(), json!("greeting"))]);
        assert!(store.get_applicable(agent, &ctx).unwrap().is_empty());
        // The name is free again once deactivated.
        store.create(greet(agent)).unwrap();
    }

    #[test]
    fn test_list_and_find_by_name() {
        let store = setup();
        let agent = AgentId::new();
        store.create(greet(agent)).unwrap();
        let listed = store
            .list_by_agent(agent, &PatternFilter::active(), 10)
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store
            .find_by_name(agent, Layer::Individual, "greet")
            .unwrap()
            .is_some());
        assert!(store.find_by_name(agent, Layer::Base, "greet").unwrap().is_none());
    }

    #[test]
    fn test_record_application_unknown() {
        let store = setup();
        assert!(matches!(
            store.record_application(PatternId::new(), true),
            Err(SiccError::NotFound { .. })
        ));
    }
}
