//! Persistence for device identities, leases, commands and the lease audit trail.
//!
//! Two backends implement [`CourierStore`]: [`MemoryStore`] for tests and single-node
//! deployments, and [`PostgresStore`] for everything else. Operations that must be atomic
//! for the exclusivity invariant (acquire, end) are single trait calls so each backend can
//! make them atomic in its own way.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use courier_proto::{Command, CommandResult, CommandState, ConnectionStatus, ModeratorId};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub moderator_id: ModeratorId,
    pub device_name: String,
    pub client_version: String,
    #[serde(skip)]
    pub credential_hash: String,
    pub revoked: bool,
    pub paired_at_ms: i64,
    pub revoked_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCodeRecord {
    pub code_hash: String,
    pub moderator_id: ModeratorId,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Expired,
    Released,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Expired => "expired",
            LeaseStatus::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LeaseStatus::Active),
            "expired" => Some(LeaseStatus::Expired),
            "released" => Some(LeaseStatus::Released),
            _ => None,
        }
    }
}

/// How a lease stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEnd {
    Released,
    Expired,
    TakenOver,
    Revoked,
}

impl LeaseEnd {
    pub fn status(self) -> LeaseStatus {
        match self {
            LeaseEnd::Released | LeaseEnd::TakenOver => LeaseStatus::Released,
            LeaseEnd::Expired | LeaseEnd::Revoked => LeaseStatus::Expired,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeaseEnd::Released => "released",
            LeaseEnd::Expired => "expired",
            LeaseEnd::TakenOver => "taken_over",
            LeaseEnd::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "released" => Some(LeaseEnd::Released),
            "expired" => Some(LeaseEnd::Expired),
            "taken_over" => Some(LeaseEnd::TakenOver),
            "revoked" => Some(LeaseEnd::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRecord {
    pub lease_id: Uuid,
    pub device_id: String,
    pub device_name: String,
    pub moderator_id: ModeratorId,
    #[serde(skip)]
    pub token_hash: String,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
    pub status: LeaseStatus,
    pub ended_by: Option<LeaseEnd>,
    pub ended_at_ms: Option<i64>,
    pub observed_status: ConnectionStatus,
    pub current_url: Option<String>,
}

impl LeaseRecord {
    /// Lazy liveness check; the expiry sweeper applies the same predicate eagerly.
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.status == LeaseStatus::Active && now_ms < self.expires_at_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command: Command,
    pub moderator_id: ModeratorId,
    pub state: CommandState,
    pub result: Option<CommandResult>,
    /// Set when the owning lease ended before the command completed.
    pub discarded: bool,
    pub updated_at_ms: i64,
}

impl CommandRecord {
    pub fn new(command: Command, moderator_id: ModeratorId, now_ms: i64) -> Self {
        Self {
            command,
            moderator_id,
            state: CommandState::Created,
            result: None,
            discarded: false,
            updated_at_ms: now_ms,
        }
    }

    pub fn id(&self) -> Uuid {
        self.command.id
    }

    pub fn is_owed(&self) -> bool {
        !self.discarded && self.state != CommandState::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Acquired,
    StatusChanged,
    Released,
    Expired,
    TakenOver,
    Revoked,
}

impl LeaseEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseEventKind::Acquired => "acquired",
            LeaseEventKind::StatusChanged => "status_changed",
            LeaseEventKind::Released => "released",
            LeaseEventKind::Expired => "expired",
            LeaseEventKind::TakenOver => "taken_over",
            LeaseEventKind::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "acquired" => Some(LeaseEventKind::Acquired),
            "status_changed" => Some(LeaseEventKind::StatusChanged),
            "released" => Some(LeaseEventKind::Released),
            "expired" => Some(LeaseEventKind::Expired),
            "taken_over" => Some(LeaseEventKind::TakenOver),
            "revoked" => Some(LeaseEventKind::Revoked),
            _ => None,
        }
    }
}

impl From<LeaseEnd> for LeaseEventKind {
    fn from(end: LeaseEnd) -> Self {
        match end {
            LeaseEnd::Released => LeaseEventKind::Released,
            LeaseEnd::Expired => LeaseEventKind::Expired,
            LeaseEnd::TakenOver => LeaseEventKind::TakenOver,
            LeaseEnd::Revoked => LeaseEventKind::Revoked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseEvent {
    pub id: Uuid,
    pub moderator_id: ModeratorId,
    pub lease_id: Uuid,
    pub device_id: String,
    pub kind: LeaseEventKind,
    pub detail: Option<String>,
    pub at_ms: i64,
}

/// A lease that just stopped being active together with the commands it still owed.
#[derive(Debug, Clone)]
pub struct EndedLease {
    pub lease: LeaseRecord,
    pub discarded: Vec<CommandRecord>,
}

#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Granted {
        lease: LeaseRecord,
        /// Previous active lease of the moderator, ended by this acquisition.
        replaced: Option<EndedLease>,
    },
    Conflict {
        holder: LeaseRecord,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    Advanced(CommandRecord),
    /// Requested state is not ahead of the current one; the record is returned as stored.
    Unchanged(CommandRecord),
    NotFound,
}

#[async_trait]
pub trait CourierStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn upsert_device(&self, device: DeviceRecord) -> StoreResult<()>;
    async fn device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>>;
    async fn device_by_credential(&self, credential_hash: &str)
        -> StoreResult<Option<DeviceRecord>>;
    async fn revoke_device(&self, device_id: &str, now_ms: i64)
        -> StoreResult<Option<DeviceRecord>>;
    async fn devices_for_moderator(&self, moderator_id: ModeratorId)
        -> StoreResult<Vec<DeviceRecord>>;

    async fn insert_pairing_code(&self, code: PairingCodeRecord) -> StoreResult<()>;
    /// Removes the code whatever its state; returns it only if it had not expired.
    async fn consume_pairing_code(
        &self,
        code_hash: &str,
        now_ms: i64,
    ) -> StoreResult<Option<PairingCodeRecord>>;

    /// Atomically checks the moderator's current lease and, when allowed, replaces it.
    /// A holder that is no longer live never blocks acquisition; it is ended as expired.
    async fn acquire_lease(
        &self,
        candidate: LeaseRecord,
        force_takeover: bool,
        now_ms: i64,
    ) -> StoreResult<AcquireOutcome>;
    async fn lease(&self, lease_id: Uuid) -> StoreResult<Option<LeaseRecord>>;
    async fn lease_by_token(&self, token_hash: &str) -> StoreResult<Option<LeaseRecord>>;
    async fn live_lease_for_moderator(
        &self,
        moderator_id: ModeratorId,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>>;
    async fn active_lease_for_device(&self, device_id: &str) -> StoreResult<Option<LeaseRecord>>;
    /// Extends a lease only if it is still live at `now_ms`.
    async fn renew_lease(
        &self,
        lease_id: Uuid,
        expires_at_ms: i64,
        observed_status: ConnectionStatus,
        current_url: Option<String>,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>>;
    /// Ends an active lease and discards the commands it still owed. `None` when the
    /// lease is unknown or already ended.
    async fn end_lease(
        &self,
        lease_id: Uuid,
        end: LeaseEnd,
        now_ms: i64,
    ) -> StoreResult<Option<EndedLease>>;
    async fn leases_past_expiry(&self, now_ms: i64) -> StoreResult<Vec<LeaseRecord>>;

    /// Stores the command only if its lease is still live at `now_ms`, in the same
    /// critical section that `end_lease` uses. Returns false when the lease has ended.
    async fn insert_command(&self, record: CommandRecord, now_ms: i64) -> StoreResult<bool>;
    async fn command(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>>;
    /// Not-yet-acked, non-discarded commands of a lease in enqueue order.
    async fn pending_commands(&self, lease_id: Uuid) -> StoreResult<Vec<CommandRecord>>;
    /// Moves a command forward. The first stored result is never overwritten and
    /// discarded commands never move.
    async fn advance_command(
        &self,
        command_id: Uuid,
        to: CommandState,
        result: Option<CommandResult>,
        now_ms: i64,
    ) -> StoreResult<AdvanceOutcome>;

    async fn append_event(&self, event: LeaseEvent) -> StoreResult<()>;
    async fn lease_events(
        &self,
        moderator_id: ModeratorId,
        limit: usize,
    ) -> StoreResult<Vec<LeaseEvent>>;
}
