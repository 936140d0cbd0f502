use axum::{
    extract::{Path, State},
    Json,
};
use courier_proto::{Command, CompleteCommandRequest, ModeratorId};
use uuid::Uuid;

use crate::state::{AppState, CommandView};

use super::{map_state_err, ApiResult, DeviceAuth, LeaseToken};

/// Poll fallback. The lease is resolved from the token, so no lease id travels in the path.
pub async fn poll_commands(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
) -> ApiResult<Vec<Command>> {
    let lease = state
        .authorize(&device, token.as_str(), None)
        .await
        .map_err(map_state_err)?;
    let commands = state.poll_commands(&lease).await.map_err(map_state_err)?;
    Ok(Json(commands))
}

pub async fn ack_command(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
    Path(command_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let lease = state
        .authorize(&device, token.as_str(), None)
        .await
        .map_err(map_state_err)?;
    state
        .ack_command(&lease, command_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "acked": true })))
}

/// Idempotent: a repeated completion answers 200 and leaves the first result in place.
pub async fn complete_command(
    State(state): State<AppState>,
    DeviceAuth(device): DeviceAuth,
    token: LeaseToken,
    Path(command_id): Path<Uuid>,
    Json(request): Json<CompleteCommandRequest>,
) -> ApiResult<serde_json::Value> {
    let lease = state
        .authorize(&device, token.as_str(), None)
        .await
        .map_err(map_state_err)?;
    state
        .complete_command(&lease, command_id, request.result)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "completed": true })))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path((moderator_id, command_id)): Path<(ModeratorId, Uuid)>,
) -> ApiResult<CommandView> {
    let view = state
        .command_for_moderator(moderator_id, command_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}
