use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of work dispatched to the agent holding a lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub lease_id: Uuid,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
}

impl Command {
    /// Decodes the payload into the shape expected for this command type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SendMessage,
    #[serde(rename = "check_whatsapp_number")]
    CheckWhatsAppNumber,
    RefreshPage,
    GetStatus,
    Navigate,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::SendMessage => "send_message",
            CommandType::CheckWhatsAppNumber => "check_whatsapp_number",
            CommandType::RefreshPage => "refresh_page",
            CommandType::GetStatus => "get_status",
            CommandType::Navigate => "navigate",
        }
    }
}

/// Lifecycle of a command on the manager. Ordered so that a state can only be
/// replaced by a strictly greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Created,
    Dispatched,
    Acked,
    Completed,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Created => "created",
            CommandState::Dispatched => "dispatched",
            CommandState::Acked => "acked",
            CommandState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(CommandState::Created),
            "dispatched" => Some(CommandState::Dispatched),
            "acked" => Some(CommandState::Acked),
            "completed" => Some(CommandState::Completed),
            _ => None,
        }
    }

    /// Commands in these states are still owed to the agent.
    pub fn is_pending(self) -> bool {
        matches!(self, CommandState::Created | CommandState::Dispatched)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message_id: Uuid,
    pub recipient: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckNumberPayload {
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigatePayload {
    pub url: String,
}

/// Terminal classification of an executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Message confirmed by a single or double status marker.
    Sent,
    /// Non-delivery command finished normally.
    Succeeded,
    Failed,
    PendingQr,
    PendingNetwork,
    SurfaceClosed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Sent => "sent",
            ResultStatus::Succeeded => "succeeded",
            ResultStatus::Failed => "failed",
            ResultStatus::PendingQr => "pending_qr",
            ResultStatus::PendingNetwork => "pending_network",
            ResultStatus::SurfaceClosed => "surface_closed",
        }
    }
}

/// Why a command failed. Only meaningful alongside [`ResultStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Surface navigated to a logged-out location mid-task.
    SessionExpired,
    /// Status marker stayed `pending` for the whole confirmation window.
    Timeout,
    /// A required element (usually the message input) never appeared.
    ElementNotFound,
    /// No status marker at all after the confirmation window.
    MarkerMissing,
    /// Recipient is malformed or unknown to the chat network.
    InvalidRecipient,
    /// Fatal runtime fault inside the automation surface.
    RuntimeFault,
    /// Command type or payload the agent cannot execute.
    Unsupported,
}

impl FailureKind {
    /// Terminal per-command failures are never retried.
    pub fn is_terminal(self) -> bool {
        matches!(self, FailureKind::InvalidRecipient | FailureKind::Unsupported)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::SessionExpired => "session_expired",
            FailureKind::Timeout => "timeout",
            FailureKind::ElementNotFound => "element_not_found",
            FailureKind::MarkerMissing => "marker_missing",
            FailureKind::InvalidRecipient => "invalid_recipient",
            FailureKind::RuntimeFault => "runtime_fault",
            FailureKind::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whole-task attempts the agent spent on this command.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CommandResult {
    pub fn sent(attempts: u32, marker: &str) -> Self {
        Self {
            status: ResultStatus::Sent,
            failure: None,
            detail: None,
            attempts,
            data: serde_json::json!({ "marker": marker }),
        }
    }

    pub fn succeeded(data: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Succeeded,
            failure: None,
            detail: None,
            attempts: 1,
            data,
        }
    }

    pub fn failed(kind: FailureKind, attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            failure: Some(kind),
            detail: Some(detail.into()),
            attempts,
            data: serde_json::Value::Null,
        }
    }

    pub fn scope(status: ResultStatus, attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            status,
            failure: None,
            detail: Some(detail.into()),
            attempts,
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteCommandRequest {
    pub result: CommandResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_states_only_order_forward() {
        assert!(CommandState::Created < CommandState::Dispatched);
        assert!(CommandState::Dispatched < CommandState::Acked);
        assert!(CommandState::Acked < CommandState::Completed);
        assert!(CommandState::Dispatched.is_pending());
        assert!(!CommandState::Acked.is_pending());
    }

    #[test]
    fn check_number_type_keeps_its_wire_name() {
        let encoded = serde_json::to_string(&CommandType::CheckWhatsAppNumber).unwrap();
        assert_eq!(encoded, "\"check_whatsapp_number\"");
    }

    #[test]
    fn failed_result_omits_empty_fields() {
        let result = CommandResult::failed(FailureKind::MarkerMissing, 3, "no marker");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failure"], "marker_missing");
        assert_eq!(value["attempts"], 3);
    }
}
