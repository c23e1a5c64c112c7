//! ==============================================================================
//! server.rs - hub rest surface and relay upgrade
//! ==============================================================================
//!
//! routes:
//!     GET    /health                              liveness
//!     GET    /actuators                           full snapshot
//!     GET    /actuators/:id                       one key (state null if unset)
//!     POST   /actuators/:id                       authenticated upsert
//!     GET    /actuators/poll/since/:timestampMs   delta poll
//!     POST   /devices/:id/heartbeat               presence heartbeat
//!     GET    /devices/:id/presence                presence record
//!     DELETE /devices/:id                         cascading device removal
//!     GET    /relay?device=<id>                   websocket push channel
//!
//! relationships:
//!     - used by: main.rs (hub role), tests/hub_roundtrip.rs
//!     - uses: store.rs, presence.rs, relay.rs, registry.rs
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::HostConfig;
use crate::domain::{
    ActuatorAddress, ActuatorResponse, PollResponse, SetStateRequest, SetStateResponse,
};
use crate::error::{SyncError, SyncResult};
use crate::presence::{PresenceRecord, PresenceStatus, PresenceTracker};
use crate::registry::{self, Authenticator, DeviceRegistry, StaticTokens};
use crate::relay::{self, RelayHub};
use crate::store::StateStore;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct HubState {
    pub store: Arc<StateStore>,
    pub presence: PresenceTracker,
    pub relay: Arc<RelayHub>,
    pub registry: Arc<DeviceRegistry>,
    pub auth: Arc<dyn Authenticator>,
}

impl HubState {
    /// wire the hub components from config around an already opened store
    pub fn from_config(store: Arc<StateStore>, config: &HostConfig, clock: SharedClock) -> Self {
        let registry = Arc::new(DeviceRegistry::new(&config.devices));
        Self {
            store,
            presence: PresenceTracker::new(clock, config.presence.offline_timeout_ms),
            relay: Arc::new(RelayHub::new(registry.clone())),
            registry,
            auth: Arc::new(StaticTokens::new(&config.tokens)),
        }
    }

    /// resolve the caller and check they own `device_id`
    fn authorize(&self, headers: &HeaderMap, device_id: &str) -> SyncResult<String> {
        let token = registry::bearer_token(headers)?;
        let user_id = self.auth.authenticate(token)?;
        self.registry.check_member(device_id, &user_id)?;
        Ok(user_id)
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/actuators", get(get_all_handler))
        .route("/actuators/poll/since/:timestamp", get(poll_since_handler))
        .route("/actuators/:id", get(get_one_handler).post(set_one_handler))
        .route("/devices/:id", axum::routing::delete(remove_device_handler))
        .route("/devices/:id/heartbeat", post(heartbeat_handler))
        .route("/devices/:id/presence", get(presence_handler))
        .route("/relay", get(relay_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: HubState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ==============================================================================
// actuators
// ==============================================================================

async fn get_all_handler(State(state): State<HubState>) -> Json<BTreeMap<String, Value>> {
    Json(state.store.get_all().await)
}

async fn get_one_handler(
    State(state): State<HubState>,
    Path(id): Path<String>,
) -> SyncResult<Json<ActuatorResponse>> {
    ActuatorAddress::parse(&id)?;
    let value = state.store.get_one(&id).await;
    Ok(Json(ActuatorResponse { actuator_id: id, state: value }))
}

async fn set_one_handler(
    State(state): State<HubState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<SetStateRequest>, JsonRejection>,
) -> SyncResult<Json<SetStateResponse>> {
    let address = ActuatorAddress::parse(&id)?;
    let user_id = state.authorize(&headers, &address.device_id)?;

    let Json(request) = body.map_err(|e| SyncError::InvalidRequest(e.body_text()))?;
    let value = request
        .state
        .ok_or_else(|| SyncError::InvalidState("state is required".into()))?;

    let updated_at = state.store.set_one(&id, value.clone()).await.map_err(|e| {
        warn!(actuator_id = %id, user_id = %user_id, error = %e, "actuator write rejected");
        e
    })?;
    info!(actuator_id = %id, user_id = %user_id, updated_at, "actuator updated");

    Ok(Json(SetStateResponse { actuator_id: id, state: value, updated_at }))
}

async fn poll_since_handler(
    State(state): State<HubState>,
    Path(timestamp): Path<String>,
) -> SyncResult<Json<PollResponse>> {
    let since = parse_timestamp(&timestamp)?;
    Ok(Json(state.store.poll_since(since).await))
}

/// epoch millis as sent by clients; integral or a finite non-negative float
fn parse_timestamp(raw: &str) -> SyncResult<u64> {
    if let Ok(ms) = raw.parse::<u64>() {
        return Ok(ms);
    }
    match raw.parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms.floor() as u64),
        _ => Err(SyncError::InvalidRequest(format!("invalid timestamp {:?}", raw))),
    }
}

// ==============================================================================
// devices
// ==============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub status: PresenceStatus,
    pub last_seen: u64,
}

async fn heartbeat_handler(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
) -> SyncResult<Json<HeartbeatResponse>> {
    if !state.registry.contains(&device_id) {
        return Err(SyncError::NotFound(format!("device {}", device_id)));
    }
    let record = state.presence.heartbeat(&device_id).await;
    Ok(Json(HeartbeatResponse {
        status: record.status,
        last_seen: record.last_seen.unwrap_or_default(),
    }))
}

async fn presence_handler(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
) -> SyncResult<Json<PresenceRecord>> {
    if !state.registry.contains(&device_id) {
        return Err(SyncError::NotFound(format!("device {}", device_id)));
    }
    Ok(Json(state.presence.status(&device_id).await))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveDeviceResponse {
    pub device_id: String,
    pub removed_actuators: usize,
}

async fn remove_device_handler(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> SyncResult<Json<RemoveDeviceResponse>> {
    let user_id = state.authorize(&headers, &device_id)?;

    let removed_actuators = state.store.remove_device(&device_id).await?;
    state.presence.remove(&device_id).await;
    state.relay.close_room(&device_id);
    state.registry.remove(&device_id);
    info!(device_id = %device_id, user_id = %user_id, removed_actuators, "device removed");

    Ok(Json(RemoveDeviceResponse { device_id, removed_actuators }))
}

// ==============================================================================
// relay
// ==============================================================================

#[derive(Debug, Deserialize)]
struct RelayParams {
    device: String,
}

async fn relay_handler(
    State(state): State<HubState>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match state
        .authorize(&headers, &params.device)
        .and_then(|user_id| state.relay.join(&params.device, &user_id))
    {
        Ok(session) => session,
        Err(e) => {
            warn!(device_id = %params.device, error = %e, "relay connection rejected");
            return e.into_response();
        }
    };

    let hub = state.relay.clone();
    ws.on_upgrade(move |socket| relay::serve_socket(hub, socket, session))
}
