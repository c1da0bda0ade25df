//! Per-agent, per-day learning metrics.

use crate::agent::AgentId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One `(agent_id, date)` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    /// Agent.
    pub agent_id: AgentId,
    /// UTC day.
    pub metric_date: NaiveDate,
    /// Interactions recorded.
    pub total_interactions: u64,
    /// Interactions that succeeded. Never exceeds `total_interactions`.
    pub successful_interactions: u64,
    /// Memory chunks used in replies.
    pub memory_chunks_used: u64,
    /// Pattern applications.
    pub patterns_applied: u64,
    /// Learnings consolidated.
    pub new_learnings: u64,
    /// Mean response time over interactions that reported one.
    pub avg_response_time_ms: f64,
    /// Mean satisfaction (0-5) over interactions that reported one.
    pub user_satisfaction_score: Option<f64>,
}

/// An interaction outcome fed to the metrics recorder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// Whether the reply succeeded.
    pub succeeded: bool,
    /// Time to reply.
    pub response_time_ms: u64,
    /// Optional user satisfaction (0-5).
    pub satisfaction: Option<f64>,
}

/// Counters summed (and rates averaged) over a date interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    /// Interactions.
    pub total_interactions: u64,
    /// Successful interactions.
    pub successful_interactions: u64,
    /// Memory chunks used.
    pub memory_chunks_used: u64,
    /// Pattern applications.
    pub patterns_applied: u64,
    /// Learnings consolidated.
    pub new_learnings: u64,
    /// `successful / total`, 0 without interactions.
    pub success_rate: f64,
    /// Mean response time weighted by interactions.
    pub avg_response_time_ms: f64,
    /// Mean satisfaction, when any was reported.
    pub avg_satisfaction: Option<f64>,
    /// Rows found in the interval.
    pub days_with_data: u64,
}
