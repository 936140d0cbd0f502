//! Operator-facing surface over the message processor. These routes sit behind the host
//! application's own authentication.

use axum::{
    extract::{Path, State},
    Json,
};
use courier_proto::{Command, ModeratorId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    processor::{FailedTask, Message, ModeratorPause},
    state::{AppState, StateError},
};

use super::{map_state_err, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    pub session_id: Uuid,
    pub recipient: String,
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckNumberRequest {
    pub recipient: String,
}

#[derive(Debug, Serialize)]
pub struct QuotaUsage {
    pub moderator_id: ModeratorId,
    pub used: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionPauseState {
    pub session_id: Uuid,
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct ResumeOutcome {
    pub moderator_id: ModeratorId,
    pub cleared: Option<ModeratorPause>,
}

fn processor_err(err: crate::processor::ProcessorError) -> ApiError {
    map_state_err(StateError::from(err))
}

pub async fn submit_message(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
    Json(request): Json<SubmitMessageRequest>,
) -> ApiResult<Message> {
    let message = state
        .processor()
        .submit_message(
            moderator_id,
            request.session_id,
            request.recipient,
            request.content,
        )
        .await
        .map_err(processor_err)?;
    Ok(Json(message))
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Message> {
    let message = state
        .processor()
        .message(message_id)
        .await
        .map_err(processor_err)?;
    Ok(Json(message))
}

pub async fn pause_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Message> {
    let message = state
        .processor()
        .set_message_paused(message_id, true)
        .await
        .map_err(processor_err)?;
    Ok(Json(message))
}

pub async fn resume_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Message> {
    let processor = state.processor();
    let message = processor
        .set_message_paused(message_id, false)
        .await
        .map_err(processor_err)?;
    processor
        .dispatch_moderator(message.moderator_id)
        .await
        .map_err(processor_err)?;
    let message = processor
        .message(message_id)
        .await
        .map_err(processor_err)?;
    Ok(Json(message))
}

pub async fn pause_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionPauseState> {
    state
        .processor()
        .set_session_paused(session_id, true)
        .await
        .map_err(processor_err)?;
    Ok(Json(SessionPauseState {
        session_id,
        paused: true,
    }))
}

pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionPauseState> {
    let processor = state.processor();
    processor
        .set_session_paused(session_id, false)
        .await
        .map_err(processor_err)?;
    processor.dispatch_all().await.map_err(processor_err)?;
    Ok(Json(SessionPauseState {
        session_id,
        paused: false,
    }))
}

pub async fn get_moderator_pause(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<ModeratorPause> {
    state
        .processor()
        .moderator_pause(moderator_id)
        .await
        .map_err(processor_err)?
        .map(Json)
        .ok_or(ApiError::NotFound("moderator pause"))
}

pub async fn pause_moderator(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
    body: Option<Json<PauseRequest>>,
) -> ApiResult<ModeratorPause> {
    let detail = body.and_then(|Json(body)| body.detail);
    let pause = state
        .processor()
        .pause_moderator(moderator_id, detail)
        .await
        .map_err(processor_err)?;
    Ok(Json(pause))
}

pub async fn resume_moderator(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<ResumeOutcome> {
    let cleared = state
        .processor()
        .resume_moderator(moderator_id)
        .await
        .map_err(processor_err)?;
    Ok(Json(ResumeOutcome {
        moderator_id,
        cleared,
    }))
}

pub async fn list_failed_tasks(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<Vec<FailedTask>> {
    let tasks = state
        .processor()
        .failed_tasks(moderator_id)
        .await
        .map_err(processor_err)?;
    Ok(Json(tasks))
}

pub async fn get_quota(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
) -> ApiResult<QuotaUsage> {
    let used = state
        .processor()
        .quota_usage(moderator_id)
        .await
        .map_err(processor_err)?;
    Ok(Json(QuotaUsage { moderator_id, used }))
}

pub async fn check_number(
    State(state): State<AppState>,
    Path(moderator_id): Path<ModeratorId>,
    Json(request): Json<CheckNumberRequest>,
) -> ApiResult<Command> {
    let command = state
        .processor()
        .check_number(moderator_id, request.recipient)
        .await
        .map_err(processor_err)?;
    Ok(Json(command))
}
