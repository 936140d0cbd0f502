//! Executes one `send_message` or `check_whatsapp_number` command against the surface.
//!
//! Each attempt walks `Navigating -> AwaitingReady -> Submitting -> AwaitingConfirmation`.
//! Retryable failures restart the whole attempt from `Navigating`, up to
//! `max_task_attempts`; surface-wide conditions end the command immediately so the
//! manager can pause the moderator instead of burning retries.

use std::sync::Arc;

use courier_proto::{
    CheckNumberPayload, CommandResult, FailureKind, ResultStatus, SendMessagePayload,
};
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{DeliveryTimings, Indicator, SelectorCatalog},
    surface::{AutomationSurface, SurfaceError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Navigating,
    AwaitingReady,
    Submitting,
    AwaitingConfirmation,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Navigating => "navigating",
            DeliveryState::AwaitingReady => "awaiting_ready",
            DeliveryState::Submitting => "submitting",
            DeliveryState::AwaitingConfirmation => "awaiting_confirmation",
        }
    }
}

/// Delivery-confirmation marker on the latest outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMarker {
    Pending,
    Single,
    Double,
}

impl DeliveryMarker {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMarker::Pending => "pending",
            DeliveryMarker::Single => "single",
            DeliveryMarker::Double => "double",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Send,
    Check,
}

/// How one attempt ended.
#[derive(Debug)]
enum Attempt {
    Sent(DeliveryMarker),
    /// Number check finished; `true` when the chat opened.
    Checked(bool),
    /// Ends the command now, without further whole-task retries.
    Abort(Abort),
    Retry { kind: FailureKind, detail: String },
}

#[derive(Debug)]
enum Abort {
    Scope(ResultStatus, String),
    Failed(FailureKind, String),
}

enum Ready {
    Input,
    InvalidRecipient,
}

/// Drives the delivery states. Cheap to clone; holds only configuration.
#[derive(Debug, Clone)]
pub struct DeliveryStateMachine {
    catalog: Arc<SelectorCatalog>,
    timings: DeliveryTimings,
}

impl DeliveryStateMachine {
    pub fn new(catalog: Arc<SelectorCatalog>, timings: DeliveryTimings) -> Self {
        Self { catalog, timings }
    }

    pub async fn send_message<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        payload: &SendMessagePayload,
    ) -> CommandResult {
        let recipient = match normalize_recipient(&payload.recipient) {
            Ok(recipient) => recipient,
            Err(detail) => return CommandResult::failed(FailureKind::InvalidRecipient, 0, detail),
        };
        self.run(surface, Task::Send, &recipient, &payload.content)
            .await
    }

    pub async fn check_number<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        payload: &CheckNumberPayload,
    ) -> CommandResult {
        let recipient = match normalize_recipient(&payload.recipient) {
            Ok(recipient) => recipient,
            Err(_) => {
                return CommandResult::succeeded(json!({
                    "recipient": payload.recipient,
                    "registered": false,
                    "reason": "malformed",
                }))
            }
        };
        self.run(surface, Task::Check, &recipient, "").await
    }

    async fn run<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        task: Task,
        recipient: &str,
        content: &str,
    ) -> CommandResult {
        let max_attempts = self.timings.max_task_attempts.max(1);
        let mut last = (FailureKind::Timeout, String::new());
        for attempt in 1..=max_attempts {
            let outcome = match self.attempt(surface, task, recipient, content).await {
                Ok(outcome) => outcome,
                Err(err) => self.classify_error(surface, err).await,
            };
            match outcome {
                Attempt::Sent(marker) => {
                    info!(
                        target: "courier.delivery",
                        attempt,
                        marker = marker.as_str(),
                        "message confirmed"
                    );
                    return CommandResult::sent(attempt, marker.as_str());
                }
                Attempt::Checked(registered) => {
                    let mut result = CommandResult::succeeded(json!({
                        "recipient": recipient,
                        "registered": registered,
                    }));
                    result.attempts = attempt;
                    return result;
                }
                Attempt::Abort(Abort::Scope(status, detail)) => {
                    info!(
                        target: "courier.delivery",
                        attempt,
                        status = status.as_str(),
                        %detail,
                        "delivery stopped by surface condition"
                    );
                    return CommandResult::scope(status, attempt, detail);
                }
                Attempt::Abort(Abort::Failed(kind, detail)) => {
                    let detail = self.with_artifact(surface, kind, detail).await;
                    return CommandResult::failed(kind, attempt, detail);
                }
                Attempt::Retry { kind, detail } => {
                    match kind {
                        FailureKind::MarkerMissing => warn!(
                            target: "courier.delivery",
                            attempt,
                            %detail,
                            "no status marker found on the outgoing message"
                        ),
                        _ => debug!(
                            target: "courier.delivery",
                            attempt,
                            kind = kind.as_str(),
                            %detail,
                            "attempt failed"
                        ),
                    }
                    last = (kind, detail);
                    if attempt < max_attempts {
                        sleep(self.timings.retry_backoff()).await;
                    }
                }
            }
        }
        let (kind, detail) = last;
        warn!(
            target: "courier.delivery",
            attempts = max_attempts,
            kind = kind.as_str(),
            "delivery retries exhausted"
        );
        let detail = self.with_artifact(surface, kind, detail).await;
        CommandResult::failed(kind, max_attempts, detail)
    }

    async fn attempt<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        task: Task,
        recipient: &str,
        content: &str,
    ) -> Result<Attempt, SurfaceError> {
        let mut state = DeliveryState::Navigating;
        loop {
            debug!(target: "courier.delivery", state = state.as_str(), "delivery step");
            state = match state {
                DeliveryState::Navigating => {
                    surface.navigate(&self.catalog.chat_url(recipient)).await?;
                    DeliveryState::AwaitingReady
                }
                DeliveryState::AwaitingReady => match self.await_ready(surface).await? {
                    Ok(Ready::Input) if task == Task::Check => return Ok(Attempt::Checked(true)),
                    Ok(Ready::InvalidRecipient) if task == Task::Check => {
                        return Ok(Attempt::Checked(false))
                    }
                    Ok(Ready::Input) => DeliveryState::Submitting,
                    Ok(Ready::InvalidRecipient) => {
                        return Ok(Attempt::Abort(Abort::Failed(
                            FailureKind::InvalidRecipient,
                            format!("{recipient} is not on the chat network"),
                        )))
                    }
                    Err(attempt) => return Ok(attempt),
                },
                DeliveryState::Submitting => {
                    let input = self.catalog.selectors(Indicator::MessageInput);
                    surface.fill(input, content).await?;
                    if !surface
                        .click(self.catalog.selectors(Indicator::SendButton))
                        .await?
                    {
                        debug!(target: "courier.delivery", "send button missing; submitting with enter");
                        surface.press_enter(input).await?;
                    }
                    DeliveryState::AwaitingConfirmation
                }
                DeliveryState::AwaitingConfirmation => {
                    return self.await_confirmation(surface).await;
                }
            };
        }
    }

    /// Waits for the message input. Loading overlays are waited out without eating into
    /// the readiness window, up to their own bound.
    async fn await_ready<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
    ) -> Result<Result<Ready, Attempt>, SurfaceError> {
        let mut deadline = Instant::now() + self.timings.ready_timeout();
        let mut overlay_since: Option<Instant> = None;
        loop {
            if self.visible(surface, Indicator::QrHighConfidence).await? {
                return Ok(Err(Attempt::Abort(Abort::Scope(
                    ResultStatus::PendingQr,
                    "authentication required".into(),
                ))));
            }
            let url = surface.current_url().await?;
            if self.catalog.is_logout_location(&url) {
                return Ok(Err(Attempt::Abort(Abort::Failed(
                    FailureKind::SessionExpired,
                    format!("surface logged out at {url}"),
                ))));
            }
            if self.visible(surface, Indicator::OfflineBanner).await? {
                return Ok(Err(Attempt::Abort(Abort::Scope(
                    ResultStatus::PendingNetwork,
                    "surface reports no connectivity".into(),
                ))));
            }
            if self
                .visible(surface, Indicator::InvalidRecipientDialog)
                .await?
            {
                return Ok(Ok(Ready::InvalidRecipient));
            }
            if self.visible(surface, Indicator::MessageInput).await? {
                return Ok(Ok(Ready::Input));
            }

            let now = Instant::now();
            if self.visible(surface, Indicator::Loading).await? {
                let since = *overlay_since.get_or_insert(now);
                if now.duration_since(since) >= self.timings.overlay_timeout() {
                    return Ok(Err(Attempt::Retry {
                        kind: FailureKind::Timeout,
                        detail: "loading overlay did not clear".into(),
                    }));
                }
            } else {
                if let Some(since) = overlay_since.take() {
                    deadline += now.duration_since(since);
                }
                if now >= deadline {
                    return Ok(Err(Attempt::Retry {
                        kind: FailureKind::ElementNotFound,
                        detail: "message input never appeared".into(),
                    }));
                }
            }
            sleep(self.timings.ready_poll()).await;
        }
    }

    async fn await_confirmation<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
    ) -> Result<Attempt, SurfaceError> {
        let deadline = Instant::now() + self.timings.confirm_timeout();
        let mut seen_pending = false;
        loop {
            match self.marker(surface).await? {
                Some(DeliveryMarker::Double) => return Ok(Attempt::Sent(DeliveryMarker::Double)),
                Some(DeliveryMarker::Single) => return Ok(Attempt::Sent(DeliveryMarker::Single)),
                Some(DeliveryMarker::Pending) => seen_pending = true,
                None => {}
            }
            if Instant::now() >= deadline {
                return Ok(if seen_pending {
                    Attempt::Retry {
                        kind: FailureKind::Timeout,
                        detail: "status marker stayed pending".into(),
                    }
                } else {
                    Attempt::Retry {
                        kind: FailureKind::MarkerMissing,
                        detail: "no status marker on the outgoing message".into(),
                    }
                });
            }
            sleep(self.timings.confirm_poll()).await;
        }
    }

    async fn marker<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
    ) -> Result<Option<DeliveryMarker>, SurfaceError> {
        let ordered = [
            (Indicator::MarkerDouble, DeliveryMarker::Double),
            (Indicator::MarkerSingle, DeliveryMarker::Single),
            (Indicator::MarkerPending, DeliveryMarker::Pending),
        ];
        for (indicator, marker) in ordered {
            if self.visible(surface, indicator).await? {
                return Ok(Some(marker));
            }
        }
        Ok(None)
    }

    async fn visible<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        indicator: Indicator,
    ) -> Result<bool, SurfaceError> {
        let selectors = self.catalog.selectors(indicator);
        if selectors.is_empty() {
            return Ok(false);
        }
        surface.probe(selectors).await
    }

    /// Turns a surface error into an attempt outcome. Fatal runtime faults get a recovery
    /// pass first: liveness, connectivity, then a trip back to the home page.
    async fn classify_error<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        err: SurfaceError,
    ) -> Attempt {
        match err {
            SurfaceError::Closed => Attempt::Abort(Abort::Scope(
                ResultStatus::SurfaceClosed,
                "automation surface closed".into(),
            )),
            SurfaceError::Fatal(detail) => {
                warn!(target: "courier.delivery", %detail, "fatal surface fault; recovering");
                if !surface.is_alive().await {
                    return Attempt::Abort(Abort::Scope(
                        ResultStatus::SurfaceClosed,
                        format!("surface died after fault: {detail}"),
                    ));
                }
                if matches!(self.visible(surface, Indicator::OfflineBanner).await, Ok(true)) {
                    return Attempt::Abort(Abort::Scope(
                        ResultStatus::PendingNetwork,
                        "surface offline after fault".into(),
                    ));
                }
                if !self.catalog.home_url.is_empty() {
                    if let Err(err) = surface.navigate(&self.catalog.home_url).await {
                        debug!(target: "courier.delivery", error = %err, "recovery navigation failed");
                    }
                }
                Attempt::Retry {
                    kind: FailureKind::RuntimeFault,
                    detail,
                }
            }
            SurfaceError::NotFound(detail) => Attempt::Retry {
                kind: FailureKind::ElementNotFound,
                detail,
            },
            SurfaceError::Transient(detail) => Attempt::Retry {
                kind: FailureKind::Timeout,
                detail,
            },
        }
    }

    async fn with_artifact<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
        kind: FailureKind,
        detail: String,
    ) -> String {
        match surface.capture_debug_artifact(kind.as_str()).await {
            Ok(reference) => format!("{detail} (artifact={reference})"),
            Err(err) => {
                debug!(target: "courier.delivery", error = %err, "debug artifact unavailable");
                detail
            }
        }
    }
}

/// Digits only, 7 to 15 of them. Formatting characters and a leading `+` are dropped.
pub fn normalize_recipient(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let mut digits = String::with_capacity(trimmed.len());
    for (idx, ch) in trimmed.chars().enumerate() {
        match ch {
            '0'..='9' => digits.push(ch),
            '+' if idx == 0 => {}
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return Err(format!("recipient {raw:?} contains {ch:?}")),
        }
    }
    if !(7..=15).contains(&digits.len()) {
        return Err(format!(
            "recipient {raw:?} has {} digits, expected 7 to 15",
            digits.len()
        ));
    }
    Ok(digits)
}
