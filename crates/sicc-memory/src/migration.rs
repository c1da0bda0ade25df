//! SQLite schema creation and migration.
//!
//! Creates all tables needed by the memory substrate on first boot.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 3;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: knowledge, learning and metrics tables.
///
/// `layer`, `company_id` and `version_id` mirror the reserved metadata keys
/// so that layer filters and rollback deletes stay in SQL.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Memory chunks
        CREATE TABLE IF NOT EXISTS memory_chunks (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            layer TEXT NOT NULL DEFAULT 'individual',
            company_id TEXT,
            version_id TEXT,
            source TEXT NOT NULL,
            confidence_score REAL NOT NULL DEFAULT 1.0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_agent_active ON memory_chunks(agent_id, is_active);
        CREATE INDEX IF NOT EXISTS idx_chunks_agent_version ON memory_chunks(agent_id, version_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_agent_hash ON memory_chunks(agent_id, content_hash);

        -- Behavior patterns
        CREATE TABLE IF NOT EXISTS behavior_patterns (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            pattern_name TEXT NOT NULL,
            pattern_type TEXT NOT NULL,
            trigger_context TEXT NOT NULL DEFAULT '{}',
            action_config TEXT NOT NULL DEFAULT '{}',
            total_applications INTEGER NOT NULL DEFAULT 0,
            successful_applications INTEGER NOT NULL DEFAULT 0,
            success_rate REAL NOT NULL DEFAULT 0.0,
            metadata TEXT NOT NULL DEFAULT '{}',
            layer TEXT NOT NULL DEFAULT 'individual',
            company_id TEXT,
            version_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            CHECK (successful_applications <= total_applications)
        );
        CREATE INDEX IF NOT EXISTS idx_patterns_agent_rate
            ON behavior_patterns(agent_id, is_active, success_rate DESC);
        CREATE INDEX IF NOT EXISTS idx_patterns_agent_version ON behavior_patterns(agent_id, version_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_patterns_active_name
            ON behavior_patterns(agent_id, layer, pattern_name) WHERE is_active = 1;

        -- Candidate learnings
        CREATE TABLE IF NOT EXISTS learning_logs (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            learning_type TEXT NOT NULL,
            source_data TEXT NOT NULL,
            analysis TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            dedupe_key TEXT NOT NULL,
            reviewed_by TEXT,
            reviewed_at TEXT,
            review_note TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_learnings_agent_status ON learning_logs(agent_id, status);
        CREATE INDEX IF NOT EXISTS idx_learnings_agent_key ON learning_logs(agent_id, dedupe_key);

        -- Daily metrics (running sums; averages are derived on read)
        CREATE TABLE IF NOT EXISTS daily_metrics (
            agent_id TEXT NOT NULL,
            metric_date TEXT NOT NULL,
            total_interactions INTEGER NOT NULL DEFAULT 0,
            successful_interactions INTEGER NOT NULL DEFAULT 0,
            memory_chunks_used INTEGER NOT NULL DEFAULT 0,
            patterns_applied INTEGER NOT NULL DEFAULT 0,
            new_learnings INTEGER NOT NULL DEFAULT 0,
            response_time_total_ms INTEGER NOT NULL DEFAULT 0,
            response_time_samples INTEGER NOT NULL DEFAULT 0,
            satisfaction_total REAL NOT NULL DEFAULT 0.0,
            satisfaction_samples INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent_id, metric_date),
            CHECK (successful_interactions <= total_interactions)
        );

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Initial schema');
        ",
    )?;
    Ok(())
}

/// Version 2: snapshots, niche versions and the propagation ledger.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            name TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            payload BLOB NOT NULL,
            memory_count INTEGER NOT NULL DEFAULT 0,
            pattern_count INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON snapshots(agent_id, created_at);

        CREATE TABLE IF NOT EXISTS niche_versions (
            id TEXT PRIMARY KEY,
            niche_type TEXT NOT NULL,
            version_name TEXT NOT NULL,
            memories TEXT NOT NULL DEFAULT '[]',
            patterns TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'draft',
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_niche_versions_type ON niche_versions(niche_type, created_at);

        CREATE TABLE IF NOT EXISTS niche_propagations (
            version_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            snapshot_id TEXT,
            memories_inserted INTEGER NOT NULL DEFAULT 0,
            patterns_inserted INTEGER NOT NULL DEFAULT 0,
            propagated_at TEXT NOT NULL,
            rolled_back_at TEXT,
            PRIMARY KEY (version_id, agent_id)
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (2, datetime('now'), 'Add snapshots and niche propagation');
        ",
    )?;
    Ok(())
}

/// Version 3: agent registry and conversation transcripts.
fn migrate_v3(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            niche_type TEXT,
            company_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_niche ON agents(niche_type);

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            messages TEXT NOT NULL,
            satisfaction REAL,
            started_at TEXT NOT NULL,
            PRIMARY KEY (agent_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_agent_time ON conversations(agent_id, started_at);

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (3, datetime('now'), 'Add agent registry and conversations');
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "memory_chunks",
            "behavior_patterns",
            "learning_logs",
            "daily_metrics",
            "snapshots",
            "niche_versions",
            "niche_propagations",
            "agents",
            "conversations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_pattern_counters_checked() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO behavior_patterns (id, agent_id, client_id, pattern_name, pattern_type,
                total_applications, successful_applications, created_at)
             VALUES ('p', 'a', 'c', 'n', 'tone_adjustment', 1, 2, '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
