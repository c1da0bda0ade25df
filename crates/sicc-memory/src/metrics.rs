//! Per-agent, per-day learning metrics.
//!
//! Each row keeps running sums; averages are derived when read so that
//! concurrent upserts never need a read-modify-write.

use crate::sql::{self, lock, storage};
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{Connection, Row};
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::metrics::{AggregatedMetrics, DailyMetrics, InteractionRecord};
use std::sync::{Arc, Mutex};

const METRIC_COLUMNS: &str = "agent_id, metric_date, total_interactions, successful_interactions, \
     memory_chunks_used, patterns_applied, new_learnings, response_time_total_ms, \
     response_time_samples, satisfaction_total, satisfaction_samples";

/// A plain counter column of the daily row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// `memory_chunks_used`
    MemoryChunksUsed,
    /// `patterns_applied`
    PatternsApplied,
    /// `new_learnings`
    NewLearnings,
}

impl Counter {
    fn column(&self) -> &'static str {
        match self {
            Self::MemoryChunksUsed => "memory_chunks_used",
            Self::PatternsApplied => "patterns_applied",
            Self::NewLearnings => "new_learnings",
        }
    }
}

/// Metrics store backed by SQLite.
#[derive(Clone)]
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetricsStore {
    /// Create a new metrics store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Record one interaction on today's row.
    pub fn record_interaction(&self, agent_id: AgentId, record: &InteractionRecord) -> SiccResult<()> {
        self.record_interaction_on(agent_id, today(), record)
    }

    /// Record one interaction on the row for `date`.
    pub fn record_interaction_on(
        &self,
        agent_id: AgentId,
        date: NaiveDate,
        record: &InteractionRecord,
    ) -> SiccResult<()> {
        if let Some(score) = record.satisfaction {
            if !(0.0..=5.0).contains(&score) {
                return Err(SiccError::Validation(format!(
                    "satisfaction {score} outside [0, 5]"
                )));
            }
        }
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO daily_metrics (agent_id, metric_date, total_interactions,
                successful_interactions, response_time_total_ms, response_time_samples,
                satisfaction_total, satisfaction_samples)
             VALUES (?1, ?2, 1, ?3, ?4, 1, ?5, ?6)
             ON CONFLICT(agent_id, metric_date) DO UPDATE SET
                total_interactions = total_interactions + 1,
                successful_interactions = successful_interactions + excluded.successful_interactions,
                response_time_total_ms = response_time_total_ms + excluded.response_time_total_ms,
                response_time_samples = response_time_samples + 1,
                satisfaction_total = satisfaction_total + excluded.satisfaction_total,
                satisfaction_samples = satisfaction_samples + excluded.satisfaction_samples",
            rusqlite::params![
                agent_id.0.to_string(),
                sql::day(&date),
                i64::from(record.succeeded),
                record.response_time_ms as i64,
                record.satisfaction.unwrap_or(0.0),
                i64::from(record.satisfaction.is_some()),
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    /// Add `n` memory chunk uses to today's row.
    pub fn increment_memory_usage(&self, agent_id: AgentId, n: u64) -> SiccResult<()> {
        self.increment(agent_id, today(), Counter::MemoryChunksUsed, n)
    }

    /// Add `n` pattern applications to today's row.
    pub fn increment_pattern_application(&self, agent_id: AgentId, n: u64) -> SiccResult<()> {
        self.increment(agent_id, today(), Counter::PatternsApplied, n)
    }

    /// Add `n` consolidated learnings to today's row.
    pub fn increment_new_learnings(&self, agent_id: AgentId, n: u64) -> SiccResult<()> {
        self.increment(agent_id, today(), Counter::NewLearnings, n)
    }

    /// Add `n` to one counter of the `(agent_id, date)` row.
    pub fn increment(
        &self,
        agent_id: AgentId,
        date: NaiveDate,
        counter: Counter,
        n: u64,
    ) -> SiccResult<()> {
        let conn = lock(&self.conn)?;
        bump(&conn, agent_id, date, counter, n)
    }

    /// The row for one day, if any.
    pub fn get_day(&self, agent_id: AgentId, date: NaiveDate) -> SiccResult<Option<DailyMetrics>> {
        Ok(self.list_range(agent_id, date, date)?.into_iter().next())
    }

    /// Rows in `[from, to]`, oldest first.
    pub fn list_range(
        &self,
        agent_id: AgentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SiccResult<Vec<DailyMetrics>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {METRIC_COLUMNS} FROM daily_metrics
                 WHERE agent_id = ?1 AND metric_date >= ?2 AND metric_date <= ?3
                 ORDER BY metric_date"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(
                rusqlite::params![agent_id.0.to_string(), sql::day(&from), sql::day(&to)],
                metrics_from_row,
            )
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Summed counters and averaged rates over `[from, to]`.
    pub fn get_aggregated(
        &self,
        agent_id: AgentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SiccResult<AggregatedMetrics> {
        if from > to {
            return Err(SiccError::Validation(format!(
                "metrics interval starts ({from}) after it ends ({to})"
            )));
        }
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_interactions), 0),
                    COALESCE(SUM(successful_interactions), 0),
                    COALESCE(SUM(memory_chunks_used), 0),
                    COALESCE(SUM(patterns_applied), 0),
                    COALESCE(SUM(new_learnings), 0),
                    COALESCE(SUM(response_time_total_ms), 0),
                    COALESCE(SUM(response_time_samples), 0),
                    COALESCE(SUM(satisfaction_total), 0.0),
                    COALESCE(SUM(satisfaction_samples), 0)
             FROM daily_metrics
             WHERE agent_id = ?1 AND metric_date >= ?2 AND metric_date <= ?3",
            rusqlite::params![agent_id.0.to_string(), sql::day(&from), sql::day(&to)],
            |row| {
                let days: i64 = row.get(0)?;
                let total: i64 = row.get(1)?;
                let successful: i64 = row.get(2)?;
                let rt_total: i64 = row.get(6)?;
                let rt_samples: i64 = row.get(7)?;
                let sat_total: f64 = row.get(8)?;
                let sat_samples: i64 = row.get(9)?;
                Ok(AggregatedMetrics {
                    total_interactions: total as u64,
                    successful_interactions: successful as u64,
                    memory_chunks_used: row.get::<_, i64>(3)? as u64,
                    patterns_applied: row.get::<_, i64>(4)? as u64,
                    new_learnings: row.get::<_, i64>(5)? as u64,
                    success_rate: ratio(successful as f64, total),
                    avg_response_time_ms: ratio(rt_total as f64, rt_samples),
                    avg_satisfaction: (sat_samples > 0).then(|| sat_total / sat_samples as f64),
                    days_with_data: days as u64,
                })
            },
        )
        .map_err(storage)
    }

    /// Learnings consolidated per day with data over the last `window_days`
    /// days (today included). Zero when no day has data.
    pub fn calculate_learning_velocity(&self, agent_id: AgentId, window_days: u32) -> SiccResult<f64> {
        self.learning_velocity_at(agent_id, window_days, today())
    }

    /// [`Self::calculate_learning_velocity`] with an explicit "today".
    pub fn learning_velocity_at(
        &self,
        agent_id: AgentId,
        window_days: u32,
        today: NaiveDate,
    ) -> SiccResult<f64> {
        if window_days == 0 {
            return Err(SiccError::Validation("window_days must be at least 1".into()));
        }
        let from = today
            .checked_sub_signed(Duration::days(i64::from(window_days) - 1))
            .ok_or_else(|| {
                SiccError::Validation(format!("window_days {window_days} reaches past the calendar"))
            })?;
        let agg = self.get_aggregated(agent_id, from, today)?;
        Ok(ratio(agg.new_learnings as f64, agg.days_with_data as i64))
    }
}

/// Upsert `counter += n` on the `(agent_id, date)` row.
pub(crate) fn bump(
    conn: &Connection,
    agent_id: AgentId,
    date: NaiveDate,
    counter: Counter,
    n: u64,
) -> SiccResult<()> {
    let column = counter.column();
    conn.execute(
        &format!(
            "INSERT INTO daily_metrics (agent_id, metric_date, {column}) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, metric_date) DO UPDATE SET {column} = {column} + excluded.{column}"
        ),
        rusqlite::params![agent_id.0.to_string(), sql::day(&date), n as i64],
    )
    .map_err(storage)?;
    Ok(())
}

/// Current UTC day.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn ratio(numerator: f64, denominator: i64) -> f64 {
    if denominator <= 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<DailyMetrics> {
    let agent: String = row.get(0)?;
    let date: String = row.get(1)?;
    let rt_total: i64 = row.get(7)?;
    let rt_samples: i64 = row.get(8)?;
    let sat_total: f64 = row.get(9)?;
    let sat_samples: i64 = row.get(10)?;
    Ok(DailyMetrics {
        agent_id: AgentId(sql::parse_uuid(0, &agent)?),
        metric_date: sql::parse_day(1, &date)?,
        total_interactions: row.get::<_, i64>(2)? as u64,
        successful_interactions: row.get::<_, i64>(3)? as u64,
        memory_chunks_used: row.get::<_, i64>(4)? as u64,
        patterns_applied: row.get::<_, i64>(5)? as u64,
        new_learnings: row.get::<_, i64>(6)? as u64,
        avg_response_time_ms: ratio(rt_total as f64, rt_samples),
        user_satisfaction_score: (sat_samples > 0).then(|| sat_total / sat_samples as f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::tests::shared_conn;

    fn setup() -> MetricsStore {
        MetricsStore::new(shared_conn())
    }

    fn interaction(succeeded: bool, ms: u64, satisfaction: Option<f64>) -> InteractionRecord {
        InteractionRecord {
            succeeded,
            response_time_ms: ms,
            satisfaction,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_aggregate_single_day() {
        let store = setup();
        let agent = AgentId::new();
        let d = date("2024-05-10");
        for _ in 0..5 {
            store
                .record_interaction_on(agent, d, &interaction(true, 100, None))
                .unwrap();
        }
        for _ in 0..2 {
            store
                .record_interaction_on(agent, d, &interaction(false, 400, Some(2.0)))
                .unwrap();
        }
        let agg = store.get_aggregated(agent, d, d).unwrap();
        assert_eq!(agg.total_interactions, 7);
        assert_eq!(agg.successful_interactions, 5);
        assert_eq!(agg.days_with_data, 1);
        assert!((agg.avg_response_time_ms - 1300.0 / 7.0).abs() < 1e-9);
        assert_eq!(agg.avg_satisfaction, Some(2.0));

        let row = store.get_day(agent, d).unwrap().unwrap();
        assert!(row.successful_interactions <= row.total_interactions);
    }

    #[test]
    fn test_counters_upsert_same_row() {
        let store = setup();
        let agent = AgentId::new();
        let d = date("2024-05-10");
        store.increment(agent, d, Counter::MemoryChunksUsed, 3).unwrap();
        store.increment(agent, d, Counter::MemoryChunksUsed, 2).unwrap();
        store.increment(agent, d, Counter::PatternsApplied, 1).unwrap();
        let row = store.get_day(agent, d).unwrap().unwrap();
        assert_eq!(row.memory_chunks_used, 5);
        assert_eq!(row.patterns_applied, 1);
        assert_eq!(row.total_interactions, 0);
        assert_eq!(row.user_satisfaction_score, None);
    }

    #[test]
    fn test_velocity_without_data_is_zero() {
        let store = setup();
        assert_eq!(
            store.calculate_learning_velocity(AgentId::new(), 7).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_velocity_divides_by_days_with_data() {
        let store = setup();
        let agent = AgentId::new();
        let today = date("2024-05-10");
        store.increment(agent, today, Counter::NewLearnings, 3).unwrap();
        store
            .record_interaction_on(agent, date("2024-05-08"), &interaction(true, 10, None))
            .unwrap();
        // Outside the 7-day window.
        store.increment(agent, date("2024-04-01"), Counter::NewLearnings, 9).unwrap();
        let v = store.learning_velocity_at(agent, 7, today).unwrap();
        assert!((v - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_inputs() {
        let store = setup();
        let agent = AgentId::new();
        assert!(matches!(
            store.record_interaction(agent, &interaction(true, 1, Some(7.5))),
            Err(SiccError::Validation(_))
        ));
        assert!(matches!(
            store.get_aggregated(agent, date("2024-05-10"), date("2024-05-01")),
            Err(SiccError::Validation(_))
        ));
        assert!(matches!(
            store.calculate_learning_velocity(agent, 0),
            Err(SiccError::Validation(_))
        ));
        assert!(matches!(
            store.calculate_learning_velocity(agent, u32::MAX),
            Err(SiccError::Validation(_))
        ));
    }
}
