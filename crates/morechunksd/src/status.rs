//! HTTP status endpoint: exposes connection state as JSON and lets an
//! operator adjust the live limits.

use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use morechunks_services::{ConnectionSnapshot, ConnectionTable, LiveLimits, SharedStore};

#[derive(Clone)]
pub struct StatusState {
    pub table: ConnectionTable,
    pub store: SharedStore,
    pub limits: LiveLimits,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub connections: usize,
    pub stored_chunks: usize,
    pub limits: LimitsInfo,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsInfo {
    pub max_chunks_per_second: u32,
    pub allowed_versions: Option<Vec<String>>,
}

fn limits_info(limits: &LiveLimits) -> LimitsInfo {
    LimitsInfo {
        max_chunks_per_second: limits.max_chunks_per_second(),
        allowed_versions: limits.allowed_versions(),
    }
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connections: state.table.len(),
        stored_chunks: state.store.count(),
        limits: limits_info(&state.limits),
    })
}

// ── /connections ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionSnapshot>,
}

async fn handle_connections(State(state): State<StatusState>) -> Json<ConnectionsResponse> {
    let mut connections: Vec<ConnectionSnapshot> =
        state.table.iter().map(|e| e.value().clone()).collect();
    connections.sort_by_key(|c| c.id);
    Json(ConnectionsResponse { connections })
}

// ── /limits ──────────────────────────────────────────────────────────────────

/// Partial update. Omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct LimitsUpdate {
    pub max_chunks_per_second: Option<u32>,
    pub allowed_versions: Option<Vec<String>>,
    /// Turn version enforcement off. Wins over `allowed_versions`.
    #[serde(default)]
    pub clear_allowed_versions: bool,
}

async fn handle_limits(
    State(state): State<StatusState>,
    Json(update): Json<LimitsUpdate>,
) -> Json<LimitsInfo> {
    if let Some(rate) = update.max_chunks_per_second {
        state.limits.set_max_chunks_per_second(rate);
    }
    if update.clear_allowed_versions {
        state.limits.set_allowed_versions(None);
    } else if let Some(versions) = update.allowed_versions {
        state.limits.set_allowed_versions(Some(versions));
    }

    let info = limits_info(&state.limits);
    tracing::info!(
        max_chunks_per_second = info.max_chunks_per_second,
        allowed_versions = ?info.allowed_versions,
        "limits updated via status endpoint"
    );
    Json(info)
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/connections", get(handle_connections))
        .route("/limits", post(handle_limits))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
