mod auth;
mod channel;
mod commands;
mod leases;
mod operators;
mod pairing;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_proto::ApiErrorBody;
use tracing::error;

use crate::state::{AppState, Readiness, StateError};

pub use auth::{DeviceAuth, LeaseToken};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics))
        // agent surface
        .route("/pairing/complete", post(pairing::complete_pairing))
        .route("/devices/self-revoke", post(pairing::self_revoke))
        .route("/leases", post(leases::acquire_lease))
        .route("/leases/:lease_id/heartbeat", post(leases::heartbeat))
        .route("/leases/:lease_id/release", post(leases::release_lease))
        .route("/leases/:lease_id/channel", get(channel::channel_upgrade))
        .route("/commands/pending", get(commands::poll_commands))
        .route("/commands/:command_id/ack", post(commands::ack_command))
        .route("/commands/:command_id/complete", post(commands::complete_command))
        // operator surface
        .route(
            "/moderators/:moderator_id/pairing-codes",
            post(pairing::create_pairing_code),
        )
        .route("/moderators/:moderator_id/devices", get(pairing::list_devices))
        .route("/devices/:device_id/revoke", post(pairing::revoke_device))
        .route("/moderators/:moderator_id/lease", get(leases::get_lease))
        .route(
            "/moderators/:moderator_id/lease-events",
            get(leases::list_lease_events),
        )
        .route(
            "/moderators/:moderator_id/messages",
            post(operators::submit_message),
        )
        .route("/messages/:message_id", get(operators::get_message))
        .route("/messages/:message_id/pause", post(operators::pause_message))
        .route("/messages/:message_id/resume", post(operators::resume_message))
        .route("/sessions/:session_id/pause", post(operators::pause_session))
        .route("/sessions/:session_id/resume", post(operators::resume_session))
        .route(
            "/moderators/:moderator_id/pause",
            get(operators::get_moderator_pause).post(operators::pause_moderator),
        )
        .route(
            "/moderators/:moderator_id/resume",
            post(operators::resume_moderator),
        )
        .route(
            "/moderators/:moderator_id/failed-tasks",
            get(operators::list_failed_tasks),
        )
        .route("/moderators/:moderator_id/quota", get(operators::get_quota))
        .route(
            "/moderators/:moderator_id/check-number",
            post(operators::check_number),
        )
        .route(
            "/moderators/:moderator_id/commands/:command_id",
            get(commands::get_command),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<Readiness> {
    Json(state.readiness())
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::export_prometheus(),
    )
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    LeaseExpired,
    LeaseConflict { current_device_name: String },
    NoActiveLease,
    NotFound(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotResumable(String),
    Internal,
}

impl ApiError {
    fn parts(self) -> (StatusCode, ApiErrorBody) {
        let body = |error: &str, message: Option<String>| ApiErrorBody {
            error: error.to_string(),
            message,
            current_device_name: None,
        };
        match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, body("unauthenticated", None)),
            ApiError::LeaseExpired => (
                StatusCode::GONE,
                body("lease_expired", Some("re-acquire the lease".into())),
            ),
            ApiError::LeaseConflict {
                current_device_name,
            } => (
                StatusCode::CONFLICT,
                ApiErrorBody {
                    error: "lease_conflict".into(),
                    message: Some(format!("lease held by {current_device_name}")),
                    current_device_name: Some(current_device_name),
                },
            ),
            ApiError::NoActiveLease => (StatusCode::CONFLICT, body("no_active_lease", None)),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                body("not_found", Some(format!("{what} not found"))),
            ),
            ApiError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, body("forbidden", Some(msg.to_string())))
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, body("bad_request", Some(msg))),
            ApiError::NotResumable(msg) => {
                (StatusCode::CONFLICT, body("not_resumable", Some(msg)))
            }
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, body("internal", None)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}

pub(crate) fn map_state_err(err: StateError) -> ApiError {
    match err {
        StateError::Unauthenticated => ApiError::Unauthenticated,
        StateError::Forbidden(msg) => ApiError::Forbidden(msg),
        StateError::LeaseExpired => ApiError::LeaseExpired,
        StateError::LeaseConflict {
            current_device_name,
        } => ApiError::LeaseConflict {
            current_device_name,
        },
        StateError::NoActiveLease => ApiError::NoActiveLease,
        StateError::NotFound(what) => ApiError::NotFound(what),
        StateError::BadRequest(msg) => ApiError::BadRequest(msg),
        StateError::NotResumable(reason) => ApiError::NotResumable(format!(
            "{} clears when the surface reconnects",
            reason.as_str()
        )),
        StateError::Store(e) => {
            error!(error = %e, "storage operation failed");
            ApiError::Internal
        }
        StateError::Internal(msg) => {
            error!(error = %msg, "internal failure");
            ApiError::Internal
        }
    }
}
