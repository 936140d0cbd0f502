//! Turns queued messages into `send_message` commands and folds delivery results back
//! into message state, moderator pauses, failure records and quota usage.

mod pause;
mod quota;
mod repository;

pub use pause::{DispatchGate, ModeratorPause, PauseReason};
pub use quota::{InMemoryQuotaLedger, QuotaLedger};
pub use repository::{
    FailedTask, InMemoryMessageRepository, Message, MessageRepository, MessageStatus,
};

use std::sync::Arc;

use courier_proto::{
    CheckNumberPayload, Command, CommandResult, CommandType, ConnectionStatus, FailureKind,
    ModeratorId, ResultStatus, SendMessagePayload,
};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    commands::{CommandError, CommandQueue},
    leases::{LeaseError, LeaseManager},
    metrics,
    store::CommandRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("message {0} does not exist")]
    MissingMessage(Uuid),
    #[error("repository backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("message not found")]
    NotFound,
    #[error("moderator pause {0:?} clears only when the surface reconnects")]
    NotResumable(PauseReason),
    #[error("moderator has no active lease")]
    NoActiveLease,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub skipped: usize,
}

/// What applying one delivery result did to its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Sent,
    Requeued { attempts: u32 },
    PermanentlyFailed,
    ModeratorPaused { reason: PauseReason, newly: bool },
    /// Result for a command the message no longer waits on.
    Stale,
}

pub struct MessageProcessor {
    messages: Arc<dyn MessageRepository>,
    quota: Arc<dyn QuotaLedger>,
    leases: Arc<LeaseManager>,
    commands: Arc<CommandQueue>,
    clock: SharedClock,
    max_attempts: u32,
    moderator_locks: DashMap<ModeratorId, Arc<Mutex<()>>>,
}

impl MessageProcessor {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        quota: Arc<dyn QuotaLedger>,
        leases: Arc<LeaseManager>,
        commands: Arc<CommandQueue>,
        clock: SharedClock,
        max_attempts: u32,
    ) -> Self {
        Self {
            messages,
            quota,
            leases,
            commands,
            clock,
            max_attempts: max_attempts.max(1),
            moderator_locks: DashMap::new(),
        }
    }

    /// Serialises message mutations per moderator; moderators never block each other.
    async fn lock(&self, moderator_id: ModeratorId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .moderator_locks
            .entry(moderator_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub async fn submit_message(
        &self,
        moderator_id: ModeratorId,
        session_id: Uuid,
        recipient: String,
        content: String,
    ) -> Result<Message, ProcessorError> {
        if recipient.trim().is_empty() || content.is_empty() {
            return Err(ProcessorError::BadRequest(
                "recipient and content are required".into(),
            ));
        }
        let now = self.clock.now_ms();
        let message = Message {
            id: Uuid::new_v4(),
            moderator_id,
            session_id,
            recipient,
            content,
            status: MessageStatus::Queued,
            paused: false,
            attempts: 0,
            command_id: None,
            last_error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.messages.insert_message(message.clone()).await?;
        debug!(moderator_id, message_id = %message.id, "message queued");
        self.dispatch_moderator(moderator_id).await?;
        Ok(self
            .messages
            .message(message.id)
            .await?
            .unwrap_or(message))
    }

    pub async fn message(&self, message_id: Uuid) -> Result<Message, ProcessorError> {
        self.messages
            .message(message_id)
            .await?
            .ok_or(ProcessorError::NotFound)
    }

    pub async fn dispatch_all(&self) -> Result<DispatchReport, ProcessorError> {
        let mut total = DispatchReport::default();
        for moderator_id in self.messages.moderators_with_queued().await? {
            match self.dispatch_moderator(moderator_id).await {
                Ok(report) => {
                    total.dispatched += report.dispatched;
                    total.skipped += report.skipped;
                }
                Err(err) => warn!(moderator_id, error = %err, "dispatch failed"),
            }
        }
        Ok(total)
    }

    /// Hands every dispatchable queued message of a moderator to its live lease.
    /// Skipped messages keep their attempt count.
    pub async fn dispatch_moderator(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<DispatchReport, ProcessorError> {
        let _guard = self.lock(moderator_id).await;
        let queued = self.messages.queued_messages(moderator_id).await?;
        let mut report = DispatchReport::default();
        if queued.is_empty() {
            return Ok(report);
        }

        let moderator_pause = self.messages.moderator_pause(moderator_id).await?;
        if let Some(pause) = &moderator_pause {
            report.skipped = queued.len();
            debug!(
                moderator_id,
                reason = pause.reason.as_str(),
                skipped = report.skipped,
                "moderator paused"
            );
            return Ok(report);
        }
        let Some(lease) = self.leases.live_lease_for_moderator(moderator_id).await? else {
            report.skipped = queued.len();
            return Ok(report);
        };

        for mut message in queued {
            let session_paused = self.messages.session_paused(message.session_id).await?;
            let gate = DispatchGate::evaluate(None, session_paused, message.paused);
            if !gate.is_open() {
                report.skipped += 1;
                continue;
            }
            let payload = serde_json::to_value(SendMessagePayload {
                message_id: message.id,
                recipient: message.recipient.clone(),
                content: message.content.clone(),
            })
            .map_err(|err| ProcessorError::BadRequest(err.to_string()))?;
            let command = match self
                .commands
                .enqueue(&lease, CommandType::SendMessage, payload)
                .await
            {
                Ok(command) => command,
                Err(CommandError::LeaseEnded) => {
                    // Whatever is left stays queued for the next lease.
                    report.skipped += 1;
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            message.status = MessageStatus::Dispatched;
            message.command_id = Some(command.id);
            message.updated_at_ms = self.clock.now_ms();
            self.messages.update_message(message).await?;
            report.dispatched += 1;
        }
        if report.dispatched > 0 {
            info!(
                moderator_id,
                lease_id = %lease.lease_id,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "messages dispatched"
            );
        }
        Ok(report)
    }

    /// Folds a first-time command completion into message state.
    pub async fn apply_result(
        &self,
        record: &CommandRecord,
        result: &CommandResult,
    ) -> Result<Applied, ProcessorError> {
        if record.command.command_type != CommandType::SendMessage {
            return self.apply_scope_only(record.moderator_id, result).await;
        }
        let payload: SendMessagePayload = match record.command.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(command_id = %record.id(), error = %err, "send_message payload unreadable");
                return Ok(Applied::Stale);
            }
        };

        let _guard = self.lock(record.moderator_id).await;
        let Some(mut message) = self.messages.message(payload.message_id).await? else {
            return Ok(Applied::Stale);
        };
        if message.command_id != Some(record.id()) || message.status != MessageStatus::Dispatched
        {
            return Ok(Applied::Stale);
        }
        let now = self.clock.now_ms();
        message.updated_at_ms = now;
        message.command_id = None;

        let applied = match result.status {
            ResultStatus::Sent => {
                message.status = MessageStatus::Sent;
                message.last_error = None;
                self.messages.update_message(message.clone()).await?;
                self.quota.consume(message.moderator_id, 1).await?;
                metrics::QUOTA_CONSUMED.inc();
                Applied::Sent
            }
            ResultStatus::PendingQr | ResultStatus::PendingNetwork | ResultStatus::SurfaceClosed => {
                message.status = MessageStatus::Queued;
                message.last_error = result.detail.clone();
                self.messages.update_message(message.clone()).await?;
                let reason = pause_reason_for(result.status).unwrap_or(PauseReason::Manual);
                let newly = self
                    .pause_locked(message.moderator_id, reason, result.detail.clone())
                    .await?;
                Applied::ModeratorPaused { reason, newly }
            }
            ResultStatus::Failed | ResultStatus::Succeeded => {
                let failure = match result.status {
                    ResultStatus::Failed => result.failure,
                    _ => None,
                };
                let detail = result
                    .detail
                    .clone()
                    .or_else(|| Some(format!("unexpected status {}", result.status.as_str())));
                // The agent already retried the whole task; its attempts count toward the cap.
                self.charge_attempt(message, result.attempts, failure, detail, now)
                    .await?
            }
        };
        Ok(applied)
    }

    /// Commands lost with their lease have an unknown outcome: requeue and charge an attempt.
    pub async fn on_commands_discarded(
        &self,
        discarded: &[CommandRecord],
    ) -> Result<usize, ProcessorError> {
        let mut requeued = 0;
        for record in discarded {
            if record.command.command_type != CommandType::SendMessage {
                continue;
            }
            let Ok(payload) = record.command.payload_as::<SendMessagePayload>() else {
                continue;
            };
            let _guard = self.lock(record.moderator_id).await;
            let Some(message) = self.messages.message(payload.message_id).await? else {
                continue;
            };
            if message.command_id != Some(record.id())
                || message.status != MessageStatus::Dispatched
            {
                continue;
            }
            let now = self.clock.now_ms();
            let applied = self
                .charge_attempt(
                    message,
                    1,
                    None,
                    Some("outcome unknown: lease ended before completion".into()),
                    now,
                )
                .await?;
            if matches!(applied, Applied::Requeued { .. }) {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Clears a `PendingQr` pause once the agent reports the surface connected again.
    pub async fn on_agent_status(
        &self,
        moderator_id: ModeratorId,
        status: ConnectionStatus,
    ) -> Result<bool, ProcessorError> {
        if !status.is_connected() {
            return Ok(false);
        }
        let _guard = self.lock(moderator_id).await;
        match self.messages.moderator_pause(moderator_id).await? {
            Some(pause) if pause.reason == PauseReason::PendingQr => {
                self.messages.set_moderator_pause(moderator_id, None).await?;
                info!(moderator_id, "surface reconnected; pending_qr pause cleared");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn pause_moderator(
        &self,
        moderator_id: ModeratorId,
        detail: Option<String>,
    ) -> Result<ModeratorPause, ProcessorError> {
        let _guard = self.lock(moderator_id).await;
        self.pause_locked(moderator_id, PauseReason::Manual, detail)
            .await?;
        self.messages
            .moderator_pause(moderator_id)
            .await?
            .ok_or(ProcessorError::NotFound)
    }

    /// Operator resume. Returns the cleared pause, if any.
    pub async fn resume_moderator(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Option<ModeratorPause>, ProcessorError> {
        let pause = {
            let _guard = self.lock(moderator_id).await;
            let Some(pause) = self.messages.moderator_pause(moderator_id).await? else {
                return Ok(None);
            };
            if !pause.reason.operator_resumable() {
                return Err(ProcessorError::NotResumable(pause.reason));
            }
            self.messages.set_moderator_pause(moderator_id, None).await?;
            pause
        };
        info!(
            moderator_id,
            reason = pause.reason.as_str(),
            "moderator resumed by operator"
        );
        self.dispatch_moderator(moderator_id).await?;
        Ok(Some(pause))
    }

    pub async fn moderator_pause(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Option<ModeratorPause>, ProcessorError> {
        Ok(self.messages.moderator_pause(moderator_id).await?)
    }

    pub async fn set_session_paused(
        &self,
        session_id: Uuid,
        paused: bool,
    ) -> Result<(), ProcessorError> {
        self.messages.set_session_paused(session_id, paused).await?;
        info!(session_id = %session_id, paused, "session pause updated");
        Ok(())
    }

    pub async fn set_message_paused(
        &self,
        message_id: Uuid,
        paused: bool,
    ) -> Result<Message, ProcessorError> {
        let current = self.message(message_id).await?;
        let _guard = self.lock(current.moderator_id).await;
        let mut message = self.message(message_id).await?;
        message.paused = paused;
        message.updated_at_ms = self.clock.now_ms();
        self.messages.update_message(message.clone()).await?;
        Ok(message)
    }

    pub async fn failed_tasks(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Vec<FailedTask>, ProcessorError> {
        Ok(self.messages.failed_tasks(moderator_id).await?)
    }

    pub async fn quota_usage(&self, moderator_id: ModeratorId) -> Result<u64, ProcessorError> {
        Ok(self.quota.usage(moderator_id).await?)
    }

    /// Queues a number check on the moderator's live lease.
    pub async fn check_number(
        &self,
        moderator_id: ModeratorId,
        recipient: String,
    ) -> Result<Command, ProcessorError> {
        if recipient.trim().is_empty() {
            return Err(ProcessorError::BadRequest("recipient is required".into()));
        }
        let lease = self
            .leases
            .live_lease_for_moderator(moderator_id)
            .await?
            .ok_or(ProcessorError::NoActiveLease)?;
        let payload = serde_json::to_value(CheckNumberPayload { recipient })
            .map_err(|err| ProcessorError::BadRequest(err.to_string()))?;
        Ok(self
            .commands
            .enqueue(&lease, CommandType::CheckWhatsAppNumber, payload)
            .await?)
    }

    /// Results of non-message commands can still reveal a surface-wide condition.
    async fn apply_scope_only(
        &self,
        moderator_id: ModeratorId,
        result: &CommandResult,
    ) -> Result<Applied, ProcessorError> {
        let Some(reason) = pause_reason_for(result.status) else {
            return Ok(Applied::Stale);
        };
        let _guard = self.lock(moderator_id).await;
        let newly = self
            .pause_locked(moderator_id, reason, result.detail.clone())
            .await?;
        Ok(Applied::ModeratorPaused { reason, newly })
    }

    /// Sets the moderator pause unless one with the same reason is already in place.
    /// Caller holds the moderator lock.
    async fn pause_locked(
        &self,
        moderator_id: ModeratorId,
        reason: PauseReason,
        detail: Option<String>,
    ) -> Result<bool, ProcessorError> {
        if let Some(existing) = self.messages.moderator_pause(moderator_id).await? {
            if existing.reason == reason {
                return Ok(false);
            }
        }
        self.messages
            .set_moderator_pause(
                moderator_id,
                Some(ModeratorPause {
                    reason,
                    since_ms: self.clock.now_ms(),
                    detail,
                }),
            )
            .await?;
        metrics::MODERATOR_PAUSES
            .with_label_values(&[reason.as_str()])
            .inc();
        warn!(moderator_id, reason = reason.as_str(), "moderator surface paused");
        Ok(true)
    }

    /// Charges `spent` whole-task attempts (at least one) against `max_attempts`.
    /// Caller holds the moderator lock.
    async fn charge_attempt(
        &self,
        mut message: Message,
        spent: u32,
        failure: Option<FailureKind>,
        detail: Option<String>,
        now: i64,
    ) -> Result<Applied, ProcessorError> {
        message.attempts = message.attempts.saturating_add(spent.max(1));
        message.command_id = None;
        message.last_error = detail.clone();
        message.updated_at_ms = now;
        let terminal = failure.is_some_and(FailureKind::is_terminal);
        if terminal || message.attempts >= self.max_attempts {
            message.status = MessageStatus::Failed;
            self.messages.update_message(message.clone()).await?;
            self.messages
                .record_failed_task(FailedTask {
                    message_id: message.id,
                    moderator_id: message.moderator_id,
                    session_id: message.session_id,
                    recipient: message.recipient.clone(),
                    failure,
                    detail,
                    attempts: message.attempts,
                    failed_at_ms: now,
                })
                .await?;
            metrics::FAILED_TASKS.inc();
            warn!(
                moderator_id = message.moderator_id,
                message_id = %message.id,
                attempts = message.attempts,
                failure = failure.map(|kind| kind.as_str()).unwrap_or("unknown"),
                "message permanently failed"
            );
            return Ok(Applied::PermanentlyFailed);
        }
        message.status = MessageStatus::Queued;
        let attempts = message.attempts;
        self.messages.update_message(message).await?;
        Ok(Applied::Requeued { attempts })
    }
}

fn pause_reason_for(status: ResultStatus) -> Option<PauseReason> {
    match status {
        ResultStatus::PendingQr => Some(PauseReason::PendingQr),
        ResultStatus::PendingNetwork => Some(PauseReason::PendingNetwork),
        ResultStatus::SurfaceClosed => Some(PauseReason::BrowserClosure),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelRegistry,
        clock::ManualClock,
        secrets,
        store::{CourierStore, DeviceRecord, LeaseEnd, MemoryStore},
    };

    struct Harness {
        processor: MessageProcessor,
        store: Arc<MemoryStore>,
        leases: Arc<LeaseManager>,
        commands: Arc<CommandQueue>,
        repo: Arc<InMemoryMessageRepository>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock: SharedClock = Arc::new(ManualClock::new(1_000));
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            90_000,
            30_000,
        ));
        let commands = Arc::new(CommandQueue::new(
            store.clone(),
            clock.clone(),
            ChannelRegistry::new(),
        ));
        let repo = Arc::new(InMemoryMessageRepository::new());
        let processor = MessageProcessor::new(
            repo.clone(),
            Arc::new(InMemoryQuotaLedger::new()),
            leases.clone(),
            commands.clone(),
            clock,
            3,
        );
        Harness {
            processor,
            store,
            leases,
            commands,
            repo,
        }
    }

    impl Harness {
        async fn lease(&self) -> crate::store::LeaseRecord {
            let device = DeviceRecord {
                device_id: "a".into(),
                moderator_id: 7,
                device_name: "A".into(),
                client_version: "1".into(),
                credential_hash: secrets::digest("cred"),
                revoked: false,
                paired_at_ms: 0,
                revoked_at_ms: None,
            };
            self.store.upsert_device(device.clone()).await.unwrap();
            self.leases.acquire(&device, false).await.unwrap().lease
        }

        async fn complete(&self, message: &Message, result: CommandResult) -> Applied {
            let lease = self.leases.live_lease_for_moderator(7).await.unwrap().unwrap();
            let command_id = self
                .processor
                .message(message.id)
                .await
                .unwrap()
                .command_id
                .expect("message in flight");
            let completion = self
                .commands
                .complete(&lease, command_id, result.clone())
                .await
                .unwrap();
            self.processor
                .apply_result(&completion.record, &result)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn quota_moves_only_on_sent() {
        let h = harness().await;
        h.lease().await;
        let message = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234567".into(), "hi".into())
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Dispatched);
        assert_eq!(h.processor.quota_usage(7).await.unwrap(), 0);

        let applied = h
            .complete(
                &message,
                CommandResult::scope(ResultStatus::PendingQr, 1, "qr"),
            )
            .await;
        assert_eq!(
            applied,
            Applied::ModeratorPaused {
                reason: PauseReason::PendingQr,
                newly: true
            }
        );
        assert_eq!(h.processor.quota_usage(7).await.unwrap(), 0);
        let requeued = h.processor.message(message.id).await.unwrap();
        assert_eq!(requeued.status, MessageStatus::Queued);
        assert_eq!(requeued.attempts, 0);

        // Paused: dispatch skips without charging.
        let report = h.processor.dispatch_moderator(7).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert!(matches!(
            h.processor.resume_moderator(7).await,
            Err(ProcessorError::NotResumable(PauseReason::PendingQr))
        ));

        assert!(h
            .processor
            .on_agent_status(7, ConnectionStatus::Connected)
            .await
            .unwrap());
        let report = h.processor.dispatch_moderator(7).await.unwrap();
        assert_eq!(report.dispatched, 1);

        let applied = h.complete(&message, CommandResult::sent(1, "double")).await;
        assert_eq!(applied, Applied::Sent);
        assert_eq!(h.processor.quota_usage(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_and_message_pauses_hold_dispatch() {
        let h = harness().await;
        let session = Uuid::new_v4();
        let message = h
            .processor
            .submit_message(7, session, "15551234567".into(), "hi".into())
            .await
            .unwrap();
        // No lease yet: stays queued.
        assert_eq!(message.status, MessageStatus::Queued);
        h.lease().await;

        h.processor.set_session_paused(session, true).await.unwrap();
        assert_eq!(h.processor.dispatch_moderator(7).await.unwrap().dispatched, 0);

        h.processor.set_session_paused(session, false).await.unwrap();
        h.processor.set_message_paused(message.id, true).await.unwrap();
        assert_eq!(h.processor.dispatch_moderator(7).await.unwrap().dispatched, 0);

        h.processor.set_message_paused(message.id, false).await.unwrap();
        assert_eq!(h.processor.dispatch_moderator(7).await.unwrap().dispatched, 1);
        assert_eq!(h.processor.message(message.id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn retries_stop_at_the_cap() {
        let h = harness().await;
        h.lease().await;
        let message = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234567".into(), "hi".into())
            .await
            .unwrap();
        for attempt in 1..=3u32 {
            let applied = h
                .complete(
                    &message,
                    CommandResult::failed(FailureKind::Timeout, 1, "stuck pending"),
                )
                .await;
            if attempt < 3 {
                assert_eq!(applied, Applied::Requeued { attempts: attempt });
                h.processor.dispatch_moderator(7).await.unwrap();
            } else {
                assert_eq!(applied, Applied::PermanentlyFailed);
            }
        }
        let failed = h.processor.failed_tasks(7).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure, Some(FailureKind::Timeout));
        assert_eq!(h.processor.quota_usage(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_agent_retries_fail_without_redispatch() {
        let h = harness().await;
        h.lease().await;
        let message = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234567".into(), "hi".into())
            .await
            .unwrap();
        let applied = h
            .complete(
                &message,
                CommandResult::failed(FailureKind::Timeout, 3, "stuck pending"),
            )
            .await;
        assert_eq!(applied, Applied::PermanentlyFailed);
        let stored = h.processor.message(message.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(h.processor.dispatch_moderator(7).await.unwrap().dispatched, 0);
        assert_eq!(h.processor.failed_tasks(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_recipient_fails_immediately() {
        let h = harness().await;
        h.lease().await;
        let message = h
            .processor
            .submit_message(7, Uuid::new_v4(), "123".into(), "hi".into())
            .await
            .unwrap();
        let applied = h
            .complete(
                &message,
                CommandResult::failed(FailureKind::InvalidRecipient, 1, "not on network"),
            )
            .await;
        assert_eq!(applied, Applied::PermanentlyFailed);
        assert_eq!(h.processor.message(message.id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn discarded_commands_are_requeued_with_a_charge() {
        let h = harness().await;
        let lease = h.lease().await;
        let message = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234567".into(), "hi".into())
            .await
            .unwrap();
        let ended = h
            .store
            .end_lease(lease.lease_id, LeaseEnd::Released, 2_000)
            .await
            .unwrap()
            .unwrap();
        let requeued = h
            .processor
            .on_commands_discarded(&ended.discarded)
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        let message = h.processor.message(message.id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.attempts, 1);
        assert!(h.repo.queued_messages(7).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn repeated_scope_failures_pause_once() {
        let h = harness().await;
        h.lease().await;
        let first = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234567".into(), "a".into())
            .await
            .unwrap();
        let second = h
            .processor
            .submit_message(7, Uuid::new_v4(), "15551234568".into(), "b".into())
            .await
            .unwrap();
        let result = CommandResult::scope(ResultStatus::PendingNetwork, 1, "offline");
        assert_eq!(
            h.complete(&first, result.clone()).await,
            Applied::ModeratorPaused {
                reason: PauseReason::PendingNetwork,
                newly: true
            }
        );
        assert_eq!(
            h.complete(&second, result).await,
            Applied::ModeratorPaused {
                reason: PauseReason::PendingNetwork,
                newly: false
            }
        );
        let resumed = h.processor.resume_moderator(7).await.unwrap();
        assert_eq!(resumed.map(|p| p.reason), Some(PauseReason::PendingNetwork));
    }
}
