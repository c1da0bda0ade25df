//! Cost-aware rate limiting using GCRA (Generic Cell Rate Algorithm).
//!
//! Each route has a token cost: reads are cheap, embedding work costs more
//! and whole-agent operations (analysis, propagation, snapshots) the most.
//! Every client IP gets `rate_limit_per_minute` tokens per minute.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

const fn cost(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => NonZeroU32::MIN,
    }
}

pub fn operation_cost(method: &str, path: &str) -> NonZeroU32 {
    match (method, path) {
        (_, "/api/health") => cost(1),
        ("GET", "/api/agents") | ("GET", "/api/niche-versions") => cost(2),
        ("GET", p) if p.ends_with("/metrics") || p.ends_with("/learning-velocity") => cost(3),
        ("POST", "/api/agents") => cost(5),
        ("POST", p) if p.ends_with("/enrich") => cost(10),
        ("POST", p) if p.ends_with("/memories") => cost(10),
        ("POST", p) if p.ends_with("/conversations") => cost(10),
        ("POST", p) if p.starts_with("/api/learnings/batch-") => cost(20),
        ("POST", p) if p.ends_with("/snapshots") || p.ends_with("/restore") => cost(25),
        ("POST", "/api/niche-versions") => cost(30),
        ("POST", p) if p.ends_with("/analyze") => cost(50),
        ("POST", p) if p.ends_with("/propagate") || p.ends_with("/rollback") => cost(100),
        _ => cost(5),
    }
}

pub type KeyedRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// `per_minute` tokens per minute per IP (at least one).
pub fn create_rate_limiter(per_minute: u32) -> Arc<KeyedRateLimiter> {
    Arc::new(RateLimiter::keyed(Quota::per_minute(
        NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN),
    )))
}

/// GCRA rate limiting middleware.
///
/// Extracts the client IP from `ConnectInfo`, computes the cost for the
/// requested operation, and checks the GCRA limiter. Returns 429 if the
/// client has exhausted its token budget.
pub async fn gcra_rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let cost = operation_cost(&method, &path);

    if limiter.check_key_n(&ip, cost).map_or(true, |r| r.is_err()) {
        tracing::warn!(ip = %ip, cost = cost.get(), path = %path, "GCRA rate limit exceeded");
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", "60")
            .body(Body::from(
                serde_json::json!({"error": "Rate limit exceeded", "kind": "rate_limited"})
                    .to_string(),
            ))
            .unwrap_or_default();
    }

    next.run(request).await
}
