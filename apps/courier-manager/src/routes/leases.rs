use axum::{
    extract::{Path, Query, State},
    Json,
};
use courier_proto::{
    AcquireLeaseRequest, HeartbeatRequest, HeartbeatResponse, LeaseGrant, ModeratorId,
    ReleaseLeaseRequest,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    state::AppState,
    store::{LeaseEvent, LeaseRecord},
};

use super::{map_state_err, ApiResult, DeviceAuth, LeaseToken};

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn acquire_lease(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    Json(request): Json<AcquireLeaseRequest>,
) -> ApiResult<LeaseGrant> {
    let grant = state
        .acquire_lease(&device, request)
        .await
        .map_err(map_state_err)?;
    Ok(Json(grant))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
    Path(lease_id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatResponse> {
    let response = state
        .heartbeat(&device, lease_id, token.as_str(), request)
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

pub async fn release_lease(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
    Path(lease_id): Path<Uuid>,
    body: Option<Json<ReleaseLeaseRequest>>,
) -> ApiResult<serde_json::Value> {
    let reason = body.and_then(|Json(body)| body.reason);
    state
        .release_lease(&device, lease_id, token.as_str(), reason)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "released": true })))
}

pub async fn get_lease(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<LeaseRecord> {
    let lease = state.live_lease(moderator_id).await.map_err(map_state_err)?;
    Ok(Json(lease))
}

pub async fn list_lease_events(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<LeaseEvent>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = state
        .lease_events(moderator_id, limit)
        .await
        .map_err(map_state_err)?;
    Ok(Json(events))
}
