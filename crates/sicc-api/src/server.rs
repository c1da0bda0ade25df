//! Router assembly and the serve loop.

use crate::rate_limiter::{create_rate_limiter, gcra_rate_limit};
use crate::routes::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use sicc_kernel::SiccKernel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full router over `kernel`, rate limited per client IP.
pub fn build_router(kernel: Arc<SiccKernel>) -> Router {
    let limiter = create_rate_limiter(kernel.config.api.rate_limit_per_minute);
    let state = Arc::new(AppState {
        kernel,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/api/health", get(routes::health))
        .route(
            "/api/agents",
            post(routes::register_agent).get(routes::list_agents),
        )
        .route(
            "/api/agents/{id}",
            get(routes::get_agent).delete(routes::delete_agent),
        )
        .route("/api/agents/{id}/memories", post(routes::add_memory))
        .route("/api/agents/{id}/enrich", post(routes::enrich))
        .route("/api/agents/{id}/outcome", post(routes::record_outcome))
        .route(
            "/api/agents/{id}/conversations",
            post(routes::ingest_conversation),
        )
        .route("/api/agents/{id}/analyze", post(routes::analyze))
        .route("/api/agents/{id}/learnings", get(routes::list_learnings))
        .route("/api/agents/{id}/metrics", get(routes::metrics))
        .route(
            "/api/agents/{id}/learning-velocity",
            get(routes::learning_velocity),
        )
        .route(
            "/api/agents/{id}/snapshots",
            post(routes::create_snapshot).get(routes::list_snapshots),
        )
        .route("/api/learnings/batch-approve", post(routes::batch_approve))
        .route("/api/learnings/batch-reject", post(routes::batch_reject))
        .route("/api/learnings/{id}", get(routes::get_learning))
        .route("/api/learnings/{id}/approve", post(routes::approve_learning))
        .route("/api/learnings/{id}/reject", post(routes::reject_learning))
        .route(
            "/api/niche-versions",
            post(routes::create_niche_version).get(routes::list_niche_versions),
        )
        .route(
            "/api/niche-versions/{id}",
            get(routes::get_niche_version).delete(routes::delete_niche_version),
        )
        .route(
            "/api/niche-versions/{id}/propagations",
            get(routes::list_propagations),
        )
        .route("/api/niche-versions/{id}/propagate", post(routes::propagate))
        .route("/api/niche-versions/{id}/rollback", post(routes::rollback))
        .route(
            "/api/snapshots/{id}",
            axum::routing::delete(routes::delete_snapshot),
        )
        .route("/api/snapshots/{id}/restore", post(routes::restore_snapshot))
        .layer(axum::middleware::from_fn_with_state(limiter, gcra_rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the background workers, serve until Ctrl+C or kernel shutdown,
/// then drain the workers.
pub async fn run_server(kernel: Arc<SiccKernel>) -> std::io::Result<()> {
    let addr = kernel.config.api.listen_addr.clone();
    kernel.start_background();

    let app = build_router(kernel.clone());
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "SICC API listening");

    let token = kernel.shutdown_token().clone();
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
            _ = token.cancelled() => {}
        }
    })
    .await;

    info!("SICC API shutting down");
    kernel.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use sicc_types::config::SiccConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let kernel = SiccKernel::boot_in_memory(SiccConfig::default()).unwrap();
        build_router(Arc::new(kernel))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register(app: &Router, niche: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/agents",
            Some(json!({ "client_id": "client-1", "niche_type": niche })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["agent_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_memory_then_enrich() {
        let app = app();
        let agent = register(&app, "clinica").await;
        let (status, created) = call(
            &app,
            "POST",
            &format!("/api/agents/{agent}/memories"),
            Some(json!({ "content": "Consultas duram 30 minutos", "chunk_type": "process" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, enriched) = call(
            &app,
            "POST",
            &format!("/api/agents/{agent}/enrich"),
            Some(json!({ "message": "Quanto duram as consultas?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(enriched["original_message"], "Quanto duram as consultas?");
        assert_eq!(enriched["memories_used"][0]["id"], created["id"]);
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/agents/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let missing = sicc_types::agent::AgentId::new();
        let (status, body) = call(&app, "GET", &format!("/api/agents/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = call(
            &app,
            "GET",
            &format!("/api/agents/{missing}/learnings?status=bogus"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_review_reports_per_item() {
        let app = app();
        let unknown = sicc_types::learning::LearningId::new();
        let (status, body) = call(
            &app,
            "POST",
            "/api/learnings/batch-approve",
            Some(json!({ "ids": [unknown] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["success"], false);
        assert_eq!(body[0]["error"], "not_found");
    }

    #[tokio::test]
    async fn test_niche_version_lifecycle() {
        let app = app();
        let agent = register(&app, "mmn").await;
        let (status, version) = call(
            &app,
            "POST",
            "/api/niche-versions",
            Some(json!({
                "niche_type": "mmn",
                "version_name": "v1",
                "memories": [{ "content": "Bônus de indicação é pago todo dia 10" }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = version["id"].as_str().unwrap().to_string();

        let (status, report) =
            call(&app, "POST", &format!("/api/niche-versions/{id}/propagate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["agents"][0]["agent_id"], agent.as_str());

        let (status, listed) = call(&app, "GET", "/api/niche-versions?niche_type=mmn", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &format!("/api/niche-versions/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            call(&app, "POST", &format!("/api/niche-versions/{id}/rollback"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", &format!("/api/niche-versions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_velocity_defaults_to_zero() {
        let app = app();
        let agent = register(&app, "mmn").await;
        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/agents/{agent}/learning-velocity"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window_days"], 7);
        assert_eq!(body["learning_velocity"], 0.0);

        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/agents/{agent}/learning-velocity?window_days=4294967295"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }
}
