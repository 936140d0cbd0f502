use serde::{Deserialize, Serialize};

use crate::Command;

/// Frames the manager pushes over a lease's realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// First frame after the channel is registered; carries everything queued before it connected.
    Registered { pending: Vec<Command> },
    ExecuteCommand { command: Command },
    SessionInvalidated { reason: String },
}

/// Frames the agent may send upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_by_type() {
        let event = ChannelEvent::SessionInvalidated {
            reason: "revoked".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session_invalidated");
        assert_eq!(value["reason"], "revoked");

        let frame: AgentFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, AgentFrame::Ping);
    }
}
