//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{header::COOKIE, HeaderMap, StatusCode},
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ProvisionError;
use crate::orchestrator::{Grant, StopOutcome};
use crate::state::AppState;

// Request/Response types
#[derive(Deserialize)]
struct SpawnQuery {
    #[serde(default)]
    id: String,
}

#[derive(Serialize)]
struct SpawnResponse {
    status: &'static str,
    instance_id: String,
    template_id: String,
    host: String,
    port: u16,
    url: String,
    started_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<Grant> for SpawnResponse {
    fn from(grant: Grant) -> Self {
        Self {
            status: if grant.fresh { "started" } else { "running" },
            instance_id: grant.instance.instance_id,
            template_id: grant.instance.template_id,
            host: grant.access.host,
            port: grant.access.port,
            url: grant.access.url,
            started_at: grant.instance.start_time,
            expires_at: grant.expires_at,
        }
    }
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct InstanceInfo {
    instance_id: String,
    template_id: String,
    port: u16,
    url: String,
    started_at: DateTime<Utc>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/reqvm", get(request_instance))
        .route("/instances", get(list_instances))
        .route("/instances/:id", delete(stop_instance))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health() -> &'static str {
    "OK"
}

fn credential(headers: &HeaderMap) -> &str {
    headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn rejection(err: ProvisionError) -> (StatusCode, String) {
    match err {
        ProvisionError::Unauthenticated => (StatusCode::UNAUTHORIZED, "login first".to_string()),
        ProvisionError::UnknownTemplate(_) => (StatusCode::NOT_FOUND, "unknown template".to_string()),
        ProvisionError::NotFound(_) => (StatusCode::NOT_FOUND, "unknown instance".to_string()),
        ProvisionError::Forbidden(_) => (StatusCode::FORBIDDEN, "not your instance".to_string()),
        e if e.is_provisioning_failure() => (
            StatusCode::SERVICE_UNAVAILABLE,
            "could not provision".to_string(),
        ),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn request_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SpawnQuery>,
) -> Result<Json<SpawnResponse>, (StatusCode, String)> {
    let request_id = uuid::Uuid::new_v4();
    info!(%request_id, "GET /reqvm - template: {}", query.id);

    let grant = state
        .orchestrator
        .request(credential(&headers), &query.id)
        .await
        .map_err(rejection)?;

    info!(%request_id, "GET /reqvm - {} on {}", grant.instance.instance_id, grant.access.url);
    Ok(Json(grant.into()))
}

async fn stop_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, (StatusCode, String)> {
    let outcome = state
        .orchestrator
        .stop(credential(&headers), &id)
        .await
        .map_err(rejection)?;

    let status = match outcome {
        StopOutcome::Stopped => "stopped",
        StopOutcome::AlreadyTerminated => "already terminated",
    };
    info!("DELETE /instances/{} - {}", id, status);
    Ok(Json(StopResponse { status }))
}

async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceInfo>>, (StatusCode, String)> {
    let list = state
        .orchestrator
        .live_instances()
        .map_err(rejection)?
        .into_iter()
        .map(|(instance, access)| InstanceInfo {
            instance_id: instance.instance_id,
            template_id: instance.template_id,
            port: instance.port,
            url: access.url,
            started_at: instance.start_time,
        })
        .collect();
    Ok(Json(list))
}
