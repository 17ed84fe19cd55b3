//! HTTP status API for the signaling server
//!
//! - `GET /health` - Liveness probe with connection and room counts
//! - `GET /info` - Server-wide statistics, per-room summaries and relay counters
//! - `GET /room/:room_id/info` - Statistics for one room

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use roomcast_signaling::{DeviceType, RelayMetricsSnapshot, RoomStats, SignalingHub};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Relay whose state is reported
    pub hub: Arc<SignalingHub>,
}

impl AppState {
    pub fn new(hub: Arc<SignalingHub>) -> Self {
        Self { hub }
    }

    /// Seconds since the relay was created
    fn uptime(&self) -> f64 {
        let elapsed = Utc::now() - self.hub.started_at();
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Status pages are read by dashboards on other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/room/:room_id/info", get(room_info))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Response body for `/health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub rooms: usize,
    pub timestamp: String,
    pub uptime: f64,
}

/// Per-room entry in `/info`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub connections: usize,
    pub total_joins: u64,
    pub messages_exchanged: u64,
    pub resolution: Option<String>,
    pub fps: Option<u32>,
    pub codec: Option<String>,
    pub pixel_format: String,
    pub h264_profile: String,
    pub created: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<RoomStats> for RoomSummary {
    fn from(stats: RoomStats) -> Self {
        Self {
            connections: stats.connections,
            total_joins: stats.total_joins,
            messages_exchanged: stats.messages_exchanged,
            resolution: stats.resolution,
            fps: stats.fps,
            codec: stats.codec,
            pixel_format: stats.pixel_format.unwrap_or_else(|| "unknown".to_string()),
            h264_profile: stats.h264_profile.unwrap_or_else(|| "unknown".to_string()),
            created: stats.created_at,
            last_activity: stats.last_activity,
        }
    }
}

/// Response body for `/info`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub clients: usize,
    pub rooms: usize,
    pub device_types: BTreeMap<DeviceType, usize>,
    pub rooms_info: BTreeMap<String, RoomSummary>,
    pub uptime: f64,
    pub start_time: String,
    pub relay: RelayMetricsSnapshot,
}

/// Response body for `/room/:room_id/info`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfoResponse {
    pub id: String,
    pub clients: usize,
    pub active_clients: usize,
    pub device_types: BTreeMap<DeviceType, usize>,
    #[serde(flatten)]
    pub stats: RoomStats,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check endpoint
///
/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.registry().len(),
        rooms: state.hub.rooms().room_count(),
        timestamp: Utc::now().to_rfc3339(),
        uptime: state.uptime(),
    })
}

/// Server-wide statistics
///
/// GET /info
async fn server_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let hub = &state.hub;
    let rooms = hub.rooms();
    let rooms_info = rooms
        .room_names()
        .into_iter()
        .filter_map(|name| rooms.stats(&name).map(|s| (name, RoomSummary::from(s))))
        .collect();

    Json(InfoResponse {
        clients: hub.registry().len(),
        rooms: rooms.room_count(),
        device_types: hub.registry().device_counts(),
        rooms_info,
        uptime: state.uptime(),
        start_time: hub.started_at().to_rfc3339(),
        relay: hub.metrics().snapshot(),
    })
}

/// Statistics for one room
///
/// GET /room/:room_id/info
async fn room_info(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    let rooms = state.hub.rooms();
    let Some(stats) = rooms.stats(&room_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Room not found".to_string(),
            }),
        )
            .into_response();
    };

    let members = rooms.members(&room_id);
    Json(RoomInfoResponse {
        clients: members.len(),
        active_clients: members.iter().filter(|m| m.is_open()).count(),
        device_types: rooms.device_counts(&room_id),
        id: room_id,
        stats,
    })
    .into_response()
}
