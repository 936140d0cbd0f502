//! Shared protocol definitions for manager ↔ agent communication.
//! Kept in a dedicated crate so the browser-extension bindings can be generated
//! from the same shapes without pulling in the runtime crates.

mod channel;
mod command;
mod lease;

pub use channel::{AgentFrame, ChannelEvent};
pub use command::{
    CheckNumberPayload, Command, CommandResult, CommandState, CommandType, CompleteCommandRequest,
    FailureKind, NavigatePayload, ResultStatus, SendMessagePayload,
};
pub use lease::{
    AcquireLeaseRequest, ApiErrorBody, HeartbeatRequest, HeartbeatResponse, LeaseGrant,
    PairingCompleteRequest, PairingCompleteResponse, ReleaseLeaseRequest, SelfRevokeRequest,
};

use serde::{Deserialize, Serialize};

/// Header carrying the device credential issued at pairing.
pub const DEVICE_CREDENTIAL_HEADER: &str = "x-device-credential";
/// Header carrying the lease token returned by lease acquisition.
pub const LEASE_TOKEN_HEADER: &str = "x-lease-token";

pub type ModeratorId = i64;

/// Connectivity/authentication state of the automation surface as observed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Loading,
    QrPending,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Loading => "loading",
            ConnectionStatus::QrPending => "qr_pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
