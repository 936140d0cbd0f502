use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ConnectionStatus, ModeratorId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCompleteRequest {
    pub pairing_code: String,
    pub device_id: String,
    pub device_name: String,
    pub client_version: String,
}

/// Returned exactly once; the manager keeps only a digest of the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCompleteResponse {
    pub device_credential: String,
    pub moderator_id: ModeratorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLeaseRequest {
    pub device_id: String,
    #[serde(default)]
    pub force_takeover: bool,
}

/// Proof of exclusive control over one moderator's automation surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease_id: Uuid,
    pub lease_token: String,
    pub moderator_id: ModeratorId,
    pub expires_at_ms: i64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub observed_status: ConnectionStatus,
    #[serde(default)]
    pub current_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseLeaseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfRevokeRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// JSON body of every non-2xx manager response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_device_name: Option<String>,
}
