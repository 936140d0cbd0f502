use serde::Serialize;

/// Why a moderator's whole automation surface is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Surface needs authentication; clears only when the agent reports `connected`.
    PendingQr,
    PendingNetwork,
    BrowserClosure,
    /// Paused by an operator.
    Manual,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::PendingQr => "pending_qr",
            PauseReason::PendingNetwork => "pending_network",
            PauseReason::BrowserClosure => "browser_closure",
            PauseReason::Manual => "manual",
        }
    }

    pub fn operator_resumable(self) -> bool {
        !matches!(self, PauseReason::PendingQr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeratorPause {
    pub reason: PauseReason,
    pub since_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of evaluating the three pause scopes for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchGate {
    Open,
    ModeratorPaused(PauseReason),
    SessionPaused,
    MessagePaused,
}

impl DispatchGate {
    /// Moderator scope masks session scope, which masks message scope.
    pub fn evaluate(
        moderator: Option<&ModeratorPause>,
        session_paused: bool,
        message_paused: bool,
    ) -> Self {
        if let Some(pause) = moderator {
            return DispatchGate::ModeratorPaused(pause.reason);
        }
        if session_paused {
            return DispatchGate::SessionPaused;
        }
        if message_paused {
            return DispatchGate::MessagePaused;
        }
        DispatchGate::Open
    }

    pub fn is_open(self) -> bool {
        matches!(self, DispatchGate::Open)
    }
}
