//! Route handlers for the SICC API.

use crate::error::{ApiError, ApiResult};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use sicc_kernel::SiccKernel;
use sicc_types::agent::AgentId;
use sicc_types::learning::{LearningId, LearningStatus};
use sicc_types::memory::{ChunkType, Metadata};
use sicc_types::niche::{BundleMemory, BundlePattern, NicheVersionId};
use sicc_types::prompt::{EnrichRequest, OutcomeRecord};
use sicc_types::snapshot::SnapshotId;
use sicc_types::transcript::{Transcript, TranscriptMessage};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Header carrying the reviewer identity for learning reviews.
pub const REVIEWER_HEADER: &str = "x-reviewer";
const DEFAULT_REVIEWER: &str = "api";
const DEFAULT_PAGE: usize = 50;
const DEFAULT_METRICS_DAYS: i64 = 30;
const DEFAULT_VELOCITY_DAYS: u32 = 7;

/// Shared state behind every route.
pub struct AppState {
    pub kernel: Arc<SiccKernel>,
    pub started_at: Instant,
}

fn parse_id<T: FromStr>(entity: &str, raw: &str) -> ApiResult<T> {
    raw.parse()
        .map_err(|_| ApiError::bad_input(format!("invalid {entity} id: {raw}")))
}

fn reviewer(headers: &HeaderMap) -> String {
    headers
        .get(REVIEWER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_REVIEWER)
        .to_string()
}

// -- Health -------------------------------------------------------------

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

// -- Agents -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentBody {
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub client_id: String,
    #[serde(default)]
    pub niche_type: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,
}

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterAgentBody>,
) -> ApiResult<impl IntoResponse> {
    let agent_id = body.agent_id.unwrap_or_default();
    let record = state
        .kernel
        .register_agent(agent_id, body.client_id, body.niche_type, body.company_id)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct NicheQuery {
    #[serde(default)]
    pub niche_type: Option<String>,
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NicheQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.kernel.list_agents(query.niche_type).await?))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    Ok(Json(state.kernel.get_agent(agent_id).await?))
}

pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    state.kernel.delete_agent(agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Memories and enrichment --------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddMemoryBody {
    pub content: String,
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub company_id: Option<String>,
}

pub async fn add_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AddMemoryBody>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let memory_id = state
        .kernel
        .add_memory(agent_id, body.content, body.chunk_type, body.company_id)
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": memory_id }))))
}

/// Enrichment never fails; upstream trouble degrades to the base prompt.
pub async fn enrich(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EnrichRequest>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    Ok(Json(state.kernel.enrich_prompt(agent_id, body).await))
}

pub async fn record_outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<OutcomeRecord>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    Ok(Json(state.kernel.record_outcome(agent_id, body).await?))
}

// -- Conversations and learning -----------------------------------------

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub id: String,
    pub messages: Vec<TranscriptMessage>,
    #[serde(default)]
    pub satisfaction: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

pub async fn ingest_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<IngestBody>,
) -> ApiResult<StatusCode> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let started_at = body
        .started_at
        .or_else(|| body.messages.first().map(|m| m.timestamp))
        .unwrap_or_else(Utc::now);
    state
        .kernel
        .ingest_conversation(Transcript {
            id: body.id,
            agent_id,
            messages: body.messages,
            satisfaction: body.satisfaction,
            started_at,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeBody {
    #[serde(default)]
    pub time_window_hours: Option<u32>,
    #[serde(default)]
    pub min_messages: Option<usize>,
}

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<AnalyzeBody>>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let Json(body) = body.unwrap_or_default();
    let report = state
        .kernel
        .analyze_conversations(agent_id, body.time_window_hours, body.min_messages)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct LearningQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list_learnings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LearningQuery>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let status = query
        .status
        .as_deref()
        .map(LearningStatus::from_str)
        .transpose()
        .map_err(ApiError::bad_input)?;
    let logs = state
        .kernel
        .list_learnings(
            agent_id,
            status,
            query.limit.unwrap_or(DEFAULT_PAGE),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(logs))
}

pub async fn get_learning(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let learning_id: LearningId = parse_id("learning", &id)?;
    Ok(Json(state.kernel.get_learning(learning_id).await?))
}

pub async fn approve_learning(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let learning_id: LearningId = parse_id("learning", &id)?;
    let log = state
        .kernel
        .approve_learning(learning_id, &reviewer(&headers))
        .await?;
    Ok(Json(log))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: String,
}

pub async fn reject_learning(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<impl IntoResponse> {
    let learning_id: LearningId = parse_id("learning", &id)?;
    let Json(body) = body.unwrap_or_default();
    let log = state
        .kernel
        .reject_learning(learning_id, &reviewer(&headers), &body.reason)
        .await?;
    Ok(Json(log))
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub ids: Vec<LearningId>,
    #[serde(default)]
    pub reason: String,
}

/// Per-item results; the batch itself always succeeds.
pub async fn batch_approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    Json(state.kernel.batch_approve(&body.ids, &reviewer(&headers)).await)
}

pub async fn batch_reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    Json(
        state
            .kernel
            .batch_reject(&body.ids, &reviewer(&headers), &body.reason)
            .await,
    )
}

// -- Metrics ------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

/// Aggregate plus daily rows; defaults to the last 30 days.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let to = query.to.unwrap_or_else(|| Utc::now().date_naive());
    let from = query
        .from
        .unwrap_or_else(|| to - Duration::days(DEFAULT_METRICS_DAYS - 1));
    if from > to {
        return Err(ApiError::bad_input(format!("from {from} is after to {to}")));
    }
    let aggregated = state.kernel.metrics(agent_id, from, to).await?;
    let daily = state.kernel.daily_metrics(agent_id, from, to).await?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "from": from,
        "to": to,
        "aggregated": aggregated,
        "daily": daily,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct VelocityQuery {
    #[serde(default)]
    pub window_days: Option<u32>,
}

pub async fn learning_velocity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<VelocityQuery>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let window_days = query.window_days.unwrap_or(DEFAULT_VELOCITY_DAYS);
    let velocity = state.kernel.learning_velocity(agent_id, window_days).await?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "window_days": window_days,
        "learning_velocity": velocity,
    })))
}

// -- Niche versions -----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateVersionBody {
    pub niche_type: String,
    #[serde(default)]
    pub version_name: Option<String>,
    #[serde(default)]
    pub memories: Vec<BundleMemory>,
    #[serde(default)]
    pub patterns: Vec<BundlePattern>,
}

pub async fn create_niche_version(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateVersionBody>,
) -> ApiResult<impl IntoResponse> {
    let version = state
        .kernel
        .create_niche_version(body.niche_type, body.version_name, body.memories, body.patterns)
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

pub async fn list_niche_versions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NicheQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.kernel.list_niche_versions(query.niche_type).await?))
}

pub async fn get_niche_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version_id: NicheVersionId = parse_id("niche version", &id)?;
    Ok(Json(state.kernel.get_niche_version(version_id).await?))
}

pub async fn delete_niche_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let version_id: NicheVersionId = parse_id("niche version", &id)?;
    state.kernel.delete_niche_version(version_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_propagations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version_id: NicheVersionId = parse_id("niche version", &id)?;
    Ok(Json(state.kernel.list_propagations(version_id).await?))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PropagateBody {
    #[serde(default)]
    pub target_agents: Option<Vec<AgentId>>,
    #[serde(default = "default_true")]
    pub create_snapshots: bool,
}

impl Default for PropagateBody {
    fn default() -> Self {
        Self {
            target_agents: None,
            create_snapshots: true,
        }
    }
}

pub async fn propagate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<PropagateBody>>,
) -> ApiResult<impl IntoResponse> {
    let version_id: NicheVersionId = parse_id("niche version", &id)?;
    let Json(body) = body.unwrap_or_default();
    let report = state
        .kernel
        .propagate(version_id, body.target_agents, body.create_snapshots)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    #[serde(default)]
    pub target_agents: Option<Vec<AgentId>>,
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RollbackBody>>,
) -> ApiResult<impl IntoResponse> {
    let version_id: NicheVersionId = parse_id("niche version", &id)?;
    let Json(body) = body.unwrap_or_default();
    Ok(Json(state.kernel.rollback(version_id, body.target_agents).await?))
}

// -- Snapshots ----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SnapshotBody {
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
}

pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    let snapshot = state
        .kernel
        .create_snapshot(agent_id, body.name, body.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent_id: AgentId = parse_id("agent", &id)?;
    Ok(Json(state.kernel.list_snapshots(agent_id).await?))
}

pub async fn restore_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot_id: SnapshotId = parse_id("snapshot", &id)?;
    Ok(Json(state.kernel.restore_snapshot(snapshot_id).await?))
}

pub async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let snapshot_id: SnapshotId = parse_id("snapshot", &id)?;
    state.kernel.delete_snapshot(snapshot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
