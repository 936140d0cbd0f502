use axum::{
    extract::{Path, State},
    Json,
};
use courier_proto::{ModeratorId, PairingCompleteRequest, PairingCompleteResponse, SelfRevokeRequest};
use serde::Deserialize;

use crate::{
    state::{AppState, PairingCodeIssued},
    store::DeviceRecord,
};

use super::{map_state_err, ApiResult, DeviceAuth};

#[derive(Debug, Default, Deserialize)]
pub struct RevokeDeviceRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn create_pairing_code(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<PairingCodeIssued> {
    let issued = state
        .create_pairing_code(moderator_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(issued))
}

pub async fn complete_pairing(
    State(state): State<AppState>,
    Json(request): Json<PairingCompleteRequest>,
) -> ApiResult<PairingCompleteResponse> {
    let response = state
        .complete_pairing(request)
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

pub async fn self_revoke(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    body: Option<Json<SelfRevokeRequest>>,
) -> ApiResult<serde_json::Value> {
    let reason = body.and_then(|Json(body)| body.reason);
    state
        .self_revoke(&device, reason)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "revoked": true })))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<Vec<DeviceRecord>> {
    let devices = state.devices(moderator_id).await.map_err(map_state_err)?;
    Ok(Json(devices))
}

pub async fn revoke_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Option<Json<RevokeDeviceRequest>>,
) -> ApiResult<DeviceRecord> {
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "revoked by operator".into());
    let device = state
        .revoke_device(&device_id, &reason)
        .await
        .map_err(map_state_err)?;
    Ok(Json(device))
}
