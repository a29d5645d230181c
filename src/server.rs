//! HTTP server.
//!
//! Exposes [`Orchestrator::ask`] as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Ask a personality a question |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Caller identity
//!
//! | Header | Default |
//! |--------|---------|
//! | `x-user-id` | `"anonymous"` |
//! | `x-user-tier` | `anonymous` |
//! | `x-forwarded-for` | peer socket address (first listed address wins) |
//!
//! # Trust boundary
//!
//! The identity headers are taken as sent. Any client that reaches the
//! listener directly can claim `premium`, or pick a fresh `x-user-id` or
//! `x-forwarded-for` to get a fresh rate-limit bucket. Deploy behind an
//! authenticating proxy that strips these headers from inbound requests
//! and sets them from the verified session. Without one, bind to a
//! loopback or private address only.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "rate limited; retry after 3.0s" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unknown_personality` (404),
//! `rate_limited` (429, with a `Retry-After` header in whole seconds),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use persona_harness_core::error::PersonaError;
use persona_harness_core::ratelimit::Tier;

use crate::config::Config;
use crate::orchestrator::{AskRequest, AskResponse, Caller, Orchestrator};

const USER_ID_HEADER: &str = "x-user-id";
const USER_TIER_HEADER: &str = "x-user-tier";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Build the router. Handlers expect `ConnectInfo<SocketAddr>`, so serve it
/// with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(orchestrator)
}

/// Start the HTTP server on `server.bind`.
///
/// Also spawns the sweeper that drops idle rate-limit buckets every
/// `rate_limits.sweep_interval_secs`.
pub async fn run_server(config: &Config) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).await?;

    let limiter = orchestrator.limiter().clone();
    let sweep_every = Duration::from_secs(config.rate_limits.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = limiter.evict_idle();
            if evicted > 0 {
                debug!(evicted, remaining = limiter.bucket_count(), "evicted idle rate-limit buckets");
            }
        }
    });

    let app = router(orchestrator);
    let bind_addr = &config.server.bind;
    info!(
        bind = %bind_addr,
        personalities = config.personalities.len(),
        "persona server listening"
    );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"rate_limited"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after: Option<Duration>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(wait) = self.retry_after {
            let secs = wait.as_secs_f64().ceil().max(1.0) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<PersonaError> for AppError {
    fn from(err: PersonaError) -> Self {
        match err {
            PersonaError::RateLimited { retry_after } => AppError {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: "rate_limited".to_string(),
                message: err.to_string(),
                retry_after: Some(retry_after),
            },
            PersonaError::UnknownPersonality(_) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "unknown_personality".to_string(),
                message: err.to_string(),
                retry_after: None,
            },
            other => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: other.to_string(),
                retry_after: None,
            },
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retry_after: None,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

/// Handler for `POST /ask`.
///
/// Accepts an [`AskRequest`] body and returns an [`AskResponse`]. Degraded
/// answers (no grounding, fallback template, canned fallback text) are
/// still `200 OK`.
async fn handle_ask(
    State(orchestrator): State<Orchestrator>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if request.personality_id.trim().is_empty() {
        return Err(bad_request("personality_id must not be empty"));
    }
    let caller = caller_from_headers(&headers, peer)?;
    let response = orchestrator.ask(request, &caller).await?;
    Ok(Json(response))
}

fn caller_from_headers(headers: &HeaderMap, peer: SocketAddr) -> Result<Caller, AppError> {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let user_id = header_str(USER_ID_HEADER).unwrap_or("anonymous").to_string();
    let tier = match header_str(USER_TIER_HEADER) {
        Some(raw) => raw.parse::<Tier>().map_err(bad_request)?,
        None => Tier::Anonymous,
    };
    let ip = header_str(FORWARDED_FOR_HEADER)
        .and_then(|list| list.split(',').map(str::trim).find(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());

    Ok(Caller { user_id, ip, tier })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn peer() -> SocketAddr {
        "10.0.0.7:5555".parse().unwrap()
    }

    #[test]
    fn test_caller_defaults() {
        let caller = caller_from_headers(&HeaderMap::new(), peer()).unwrap();
        assert_eq!(caller.user_id, "anonymous");
        assert_eq!(caller.ip, "10.0.0.7");
        assert_eq!(caller.tier, Tier::Anonymous);
    }

    #[test]
    fn test_caller_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-42"));
        headers.insert(USER_TIER_HEADER, HeaderValue::from_static("Premium"));
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let caller = caller_from_headers(&headers, peer()).unwrap();
        assert_eq!(caller.user_id, "u-42");
        assert_eq!(caller.ip, "203.0.113.9");
        assert_eq!(caller.tier, Tier::Premium);
    }

    #[test]
    fn test_bad_tier_is_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_TIER_HEADER, HeaderValue::from_static("gold"));
        let err = caller_from_headers(&headers, peer()).err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let err: AppError = PersonaError::RateLimited {
            retry_after: Duration::from_millis(2300),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "rate_limited");
    }

    #[test]
    fn test_unknown_personality_maps_to_404() {
        let err: AppError = PersonaError::UnknownPersonality("zeus".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "unknown_personality");
        assert!(err.retry_after.is_none());
    }
}
