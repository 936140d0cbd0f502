use std::{sync::Arc, time::Instant};

use courier_proto::{
    AcquireLeaseRequest, Command, CommandResult, HeartbeatRequest, HeartbeatResponse, LeaseGrant,
    ModeratorId, PairingCompleteRequest, PairingCompleteResponse,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    channel::ChannelRegistry,
    clock::{SharedClock, SystemClock},
    commands::{CommandError, CommandQueue, DeliveryChannel},
    config::AppConfig,
    leases::{LeaseError, LeaseManager},
    log_throttle::{should_log_lease_event, LeaseLogKind},
    processor::{
        Applied, InMemoryMessageRepository, InMemoryQuotaLedger, MessageProcessor,
        MessageRepository, PauseReason, ProcessorError, QuotaLedger,
    },
    secrets,
    store::{
        CommandRecord, CourierStore, DeviceRecord, EndedLease, LeaseEvent, LeaseRecord,
        MemoryStore, PairingCodeRecord, StoreError,
    },
};

pub const BUILD_ID: &str = env!("COURIER_BUILD_ID");

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("lease expired")]
    LeaseExpired,
    #[error("lease held by {current_device_name}")]
    LeaseConflict { current_device_name: String },
    #[error("no active lease")]
    NoActiveLease,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("pause {0:?} is not resumable by an operator")]
    NotResumable(PauseReason),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LeaseError> for StateError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Unauthenticated => StateError::Unauthenticated,
            LeaseError::Forbidden => StateError::Forbidden("lease token does not match"),
            LeaseError::LeaseExpired => StateError::LeaseExpired,
            LeaseError::Conflict {
                current_device_name,
            } => StateError::LeaseConflict {
                current_device_name,
            },
            LeaseError::NoActiveLease => StateError::NoActiveLease,
            LeaseError::Store(err) => StateError::Store(err),
        }
    }
}

impl From<CommandError> for StateError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::NotFound => StateError::NotFound("command"),
            CommandError::Discarded | CommandError::LeaseEnded => StateError::LeaseExpired,
            CommandError::Store(err) => StateError::Store(err),
        }
    }
}

impl From<ProcessorError> for StateError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::NotFound => StateError::NotFound("message"),
            ProcessorError::NotResumable(reason) => StateError::NotResumable(reason),
            ProcessorError::NoActiveLease => StateError::NoActiveLease,
            ProcessorError::BadRequest(msg) => StateError::BadRequest(msg),
            ProcessorError::Repository(err) => StateError::Internal(err.to_string()),
            ProcessorError::Lease(err) => err.into(),
            ProcessorError::Command(err) => err.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingCodeIssued {
    pub pairing_code: String,
    pub moderator_id: ModeratorId,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandView {
    pub command: Command,
    pub state: courier_proto::CommandState,
    pub result: Option<CommandResult>,
    pub discarded: bool,
}

impl From<CommandRecord> for CommandView {
    fn from(record: CommandRecord) -> Self {
        Self {
            command: record.command,
            state: record.state,
            result: record.result,
            discarded: record.discarded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub build_id: &'static str,
    pub backend: &'static str,
    pub uptime_secs: u64,
    pub active_channels: usize,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    store: Arc<dyn CourierStore>,
    clock: SharedClock,
    leases: Arc<LeaseManager>,
    commands: Arc<CommandQueue>,
    processor: Arc<MessageProcessor>,
    started_at: Instant,
}

impl AppState {
    /// In-memory state with default configuration.
    pub fn new() -> Self {
        Self::with_store(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn CourierStore>, clock: SharedClock) -> Self {
        Self::with_parts(
            config,
            store,
            clock,
            Arc::new(InMemoryMessageRepository::new()),
            Arc::new(InMemoryQuotaLedger::new()),
        )
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn CourierStore>,
        clock: SharedClock,
        messages: Arc<dyn MessageRepository>,
        quota: Arc<dyn QuotaLedger>,
    ) -> Self {
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            config.lease_ttl_ms,
            config.heartbeat_interval_ms,
        ));
        let commands = Arc::new(CommandQueue::new(
            store.clone(),
            clock.clone(),
            ChannelRegistry::new(),
        ));
        let processor = Arc::new(MessageProcessor::new(
            messages,
            quota,
            leases.clone(),
            commands.clone(),
            clock.clone(),
            config.max_message_attempts,
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                leases,
                commands,
                processor,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.inner.processor
    }

    pub fn channels(&self) -> &ChannelRegistry {
        self.inner.commands.channels()
    }

    fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            build_id: BUILD_ID,
            backend: self.inner.store.backend_name(),
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            active_channels: self.channels().len(),
        }
    }

    // ----- pairing & device identity -----

    pub async fn create_pairing_code(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<PairingCodeIssued, StateError> {
        let code = secrets::new_pairing_code();
        let expires_at_ms = self.now_ms() + self.inner.config.pairing_code_ttl_ms as i64;
        self.inner
            .store
            .insert_pairing_code(PairingCodeRecord {
                code_hash: secrets::digest(&code),
                moderator_id,
                expires_at_ms,
            })
            .await?;
        info!(moderator_id, "pairing code issued");
        Ok(PairingCodeIssued {
            pairing_code: code,
            moderator_id,
            expires_at_ms,
        })
    }

    /// Consumes a pairing code and issues a fresh credential. Re-pairing a known device
    /// rotates its credential, clears revocation and ends any lease it held.
    pub async fn complete_pairing(
        &self,
        request: PairingCompleteRequest,
    ) -> Result<PairingCompleteResponse, StateError> {
        let device_id = request.device_id.trim();
        if device_id.is_empty() || request.device_name.trim().is_empty() {
            return Err(StateError::BadRequest(
                "device_id and device_name are required".into(),
            ));
        }
        let now = self.now_ms();
        let code = self
            .inner
            .store
            .consume_pairing_code(&secrets::digest(&request.pairing_code), now)
            .await?
            .ok_or(StateError::Unauthenticated)?;

        if self.inner.store.device(device_id).await?.is_some() {
            if let Some(ended) = self
                .inner
                .leases
                .revoke_device_lease(device_id, "device re-paired")
                .await?
            {
                self.handle_ended(ended, "device re-paired").await;
            }
        }

        let credential = secrets::new_device_credential();
        self.inner
            .store
            .upsert_device(DeviceRecord {
                device_id: device_id.to_string(),
                moderator_id: code.moderator_id,
                device_name: request.device_name.trim().to_string(),
                client_version: request.client_version,
                credential_hash: secrets::digest(&credential),
                revoked: false,
                paired_at_ms: now,
                revoked_at_ms: None,
            })
            .await?;
        info!(
            moderator_id = code.moderator_id,
            device_id, "device paired"
        );
        Ok(PairingCompleteResponse {
            device_credential: credential,
            moderator_id: code.moderator_id,
        })
    }

    pub async fn authenticate(&self, credential: &str) -> Result<DeviceRecord, StateError> {
        Ok(self.inner.leases.authenticate_device(credential).await?)
    }

    pub async fn devices(&self, moderator_id: ModeratorId) -> Result<Vec<DeviceRecord>, StateError> {
        Ok(self.inner.store.devices_for_moderator(moderator_id).await?)
    }

    /// Operator-side revocation.
    pub async fn revoke_device(&self, device_id: &str, reason: &str) -> Result<DeviceRecord, StateError> {
        let device = self
            .inner
            .store
            .revoke_device(device_id, self.now_ms())
            .await?
            .ok_or(StateError::NotFound("device"))?;
        if let Some(ended) = self
            .inner
            .leases
            .revoke_device_lease(device_id, reason)
            .await?
        {
            self.handle_ended(ended, reason).await;
        }
        warn!(
            moderator_id = device.moderator_id,
            device_id, reason, "device revoked"
        );
        Ok(device)
    }

    pub async fn self_revoke(
        &self,
        device: &DeviceRecord,
        reason: Option<String>,
    ) -> Result<(), StateError> {
        let reason = reason.unwrap_or_else(|| "self-revoked".into());
        self.revoke_device(&device.device_id, &reason).await?;
        Ok(())
    }

    // ----- leases -----

    pub async fn acquire_lease(
        &self,
        device: &DeviceRecord,
        request: AcquireLeaseRequest,
    ) -> Result<LeaseGrant, StateError> {
        if request.device_id != device.device_id {
            return Err(StateError::Forbidden(
                "device id does not match credential",
            ));
        }
        let acquired = self
            .inner
            .leases
            .acquire(device, request.force_takeover)
            .await?;
        if let Some(replaced) = acquired.replaced {
            let reason = match replaced.lease.ended_by {
                Some(end) => end.as_str(),
                None => "replaced",
            };
            self.handle_ended(replaced, reason).await;
        }
        if let Err(err) = self
            .inner
            .processor
            .dispatch_moderator(acquired.lease.moderator_id)
            .await
        {
            warn!(
                lease_id = %acquired.lease.lease_id,
                error = %err,
                "dispatch after acquisition failed"
            );
        }
        Ok(acquired.grant)
    }

    pub async fn authorize(
        &self,
        device: &DeviceRecord,
        lease_token: &str,
        lease_id: Option<Uuid>,
    ) -> Result<LeaseRecord, StateError> {
        match self
            .inner
            .leases
            .authorize(device, lease_token, lease_id)
            .await
        {
            Err(LeaseError::LeaseExpired) => {
                if let Some(id) = lease_id {
                    if should_log_lease_event(LeaseLogKind::DeadLeasePoll, id) {
                        info!(lease_id = %id, device_id = %device.device_id, "call against dead lease");
                    }
                }
                Err(StateError::LeaseExpired)
            }
            other => Ok(other?),
        }
    }

    pub async fn heartbeat(
        &self,
        device: &DeviceRecord,
        lease_id: Uuid,
        lease_token: &str,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, StateError> {
        let lease = self.authorize(device, lease_token, Some(lease_id)).await?;
        let renewed = self
            .inner
            .leases
            .heartbeat(&lease, request.observed_status, request.current_url)
            .await?;
        // A qr pause can be set while the agent keeps reporting connected.
        if request.observed_status.is_connected() {
            let cleared = self
                .inner
                .processor
                .on_agent_status(lease.moderator_id, request.observed_status)
                .await?;
            if cleared {
                self.inner
                    .processor
                    .dispatch_moderator(lease.moderator_id)
                    .await?;
            }
        }
        Ok(HeartbeatResponse {
            expires_at_ms: renewed.lease.expires_at_ms,
        })
    }

    pub async fn release_lease(
        &self,
        device: &DeviceRecord,
        lease_id: Uuid,
        lease_token: &str,
        reason: Option<String>,
    ) -> Result<(), StateError> {
        if let Some(ended) = self
            .inner
            .leases
            .release(device, lease_id, lease_token, reason.as_deref())
            .await?
        {
            self.handle_ended(ended, "released").await;
        }
        Ok(())
    }

    pub async fn live_lease(&self, moderator_id: ModeratorId) -> Result<LeaseRecord, StateError> {
        self.inner
            .leases
            .live_lease_for_moderator(moderator_id)
            .await?
            .ok_or(StateError::NotFound("lease"))
    }

    pub async fn lease_events(
        &self,
        moderator_id: ModeratorId,
        limit: usize,
    ) -> Result<Vec<LeaseEvent>, StateError> {
        Ok(self.inner.leases.events(moderator_id, limit).await?)
    }

    /// Ends leases past their expiry. Returns how many were swept.
    pub async fn sweep_expired_leases(&self) -> Result<usize, StateError> {
        let swept = self.inner.leases.sweep_expired().await?;
        let count = swept.len();
        for ended in swept {
            self.handle_ended(ended, "expired").await;
        }
        Ok(count)
    }

    async fn handle_ended(&self, ended: EndedLease, reason: &str) {
        self.channels().invalidate(ended.lease.lease_id, reason);
        if ended.discarded.is_empty() {
            return;
        }
        if let Err(err) = self
            .inner
            .processor
            .on_commands_discarded(&ended.discarded)
            .await
        {
            warn!(
                lease_id = %ended.lease.lease_id,
                error = %err,
                "failed to requeue discarded commands"
            );
        }
    }

    // ----- commands -----

    pub async fn enqueue_command(
        &self,
        lease_id: Uuid,
        command_type: courier_proto::CommandType,
        payload: serde_json::Value,
    ) -> Result<Command, StateError> {
        let lease = self.inner.leases.require_live(lease_id).await?;
        Ok(self
            .inner
            .commands
            .enqueue(&lease, command_type, payload)
            .await?)
    }

    pub async fn poll_commands(&self, lease: &LeaseRecord) -> Result<Vec<Command>, StateError> {
        Ok(self
            .inner
            .commands
            .pending(lease, DeliveryChannel::Poll)
            .await?)
    }

    pub async fn ack_command(
        &self,
        lease: &LeaseRecord,
        command_id: Uuid,
    ) -> Result<(), StateError> {
        self.inner.commands.ack(lease, command_id).await?;
        Ok(())
    }

    pub async fn complete_command(
        &self,
        lease: &LeaseRecord,
        command_id: Uuid,
        result: CommandResult,
    ) -> Result<(), StateError> {
        let completion = self
            .inner
            .commands
            .complete(lease, command_id, result.clone())
            .await?;
        if !completion.first {
            return Ok(());
        }
        let applied = self
            .inner
            .processor
            .apply_result(&completion.record, &result)
            .await?;
        if let Applied::Requeued { .. } = applied {
            self.inner
                .processor
                .dispatch_moderator(lease.moderator_id)
                .await?;
        }
        Ok(())
    }

    pub async fn command_for_moderator(
        &self,
        moderator_id: ModeratorId,
        command_id: Uuid,
    ) -> Result<CommandView, StateError> {
        self.inner
            .store
            .command(command_id)
            .await?
            .filter(|record| record.moderator_id == moderator_id)
            .map(CommandView::from)
            .ok_or(StateError::NotFound("command"))
    }

    // ----- push channel -----

    /// Registers a push channel and returns commands queued before it connected.
    pub async fn register_channel(
        &self,
        lease: &LeaseRecord,
    ) -> Result<(Uuid, mpsc::UnboundedReceiver<courier_proto::ChannelEvent>, Vec<Command>), StateError>
    {
        let (connection_id, rx) = self.channels().register(lease.lease_id);
        match self
            .inner
            .commands
            .pending(lease, DeliveryChannel::Register)
            .await
        {
            Ok(pending) => Ok((connection_id, rx, pending)),
            Err(err) => {
                self.channels().unregister(lease.lease_id, connection_id);
                Err(err.into())
            }
        }
    }

    pub fn unregister_channel(&self, lease_id: Uuid, connection_id: Uuid) {
        self.channels().unregister(lease_id, connection_id);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
