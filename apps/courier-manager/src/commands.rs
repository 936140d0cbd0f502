use std::sync::Arc;

use courier_proto::{ChannelEvent, Command, CommandResult, CommandState, CommandType};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::ChannelRegistry,
    clock::SharedClock,
    log_throttle::{should_log_lease_event, LeaseLogKind},
    metrics,
    store::{AdvanceOutcome, CommandRecord, CourierStore, LeaseRecord, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command not found")]
    NotFound,
    #[error("command was discarded when its lease ended")]
    Discarded,
    #[error("lease ended before the command was stored")]
    LeaseEnded,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    Push,
    Poll,
    Register,
}

impl DeliveryChannel {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryChannel::Push => "push",
            DeliveryChannel::Poll => "poll",
            DeliveryChannel::Register => "register",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub record: CommandRecord,
    /// False when an earlier completion already recorded the outcome.
    pub first: bool,
}

/// Per-lease FIFO of outbound work. Delivery is at-least-once across push and poll;
/// agents dedupe by command id.
pub struct CommandQueue {
    store: Arc<dyn CourierStore>,
    clock: SharedClock,
    channels: ChannelRegistry,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn CourierStore>, clock: SharedClock, channels: ChannelRegistry) -> Self {
        Self {
            store,
            clock,
            channels,
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Persists a command for a live lease and pushes it if a channel is registered.
    /// Liveness is rechecked by the store at insert time.
    pub async fn enqueue(
        &self,
        lease: &LeaseRecord,
        command_type: CommandType,
        payload: serde_json::Value,
    ) -> Result<Command, CommandError> {
        let now = self.clock.now_ms();
        let command = Command {
            id: Uuid::new_v4(),
            lease_id: lease.lease_id,
            command_type,
            payload,
            created_at_ms: now,
        };
        let stored = self
            .store
            .insert_command(CommandRecord::new(command.clone(), lease.moderator_id, now), now)
            .await?;
        if !stored {
            debug!(lease_id = %lease.lease_id, "lease ended before enqueue");
            return Err(CommandError::LeaseEnded);
        }
        metrics::COMMANDS_ENQUEUED
            .with_label_values(&[command_type.as_str()])
            .inc();
        debug!(
            lease_id = %lease.lease_id,
            command_id = %command.id,
            command_type = command_type.as_str(),
            "command enqueued"
        );

        let pushed = self.channels.send(
            lease.lease_id,
            ChannelEvent::ExecuteCommand {
                command: command.clone(),
            },
        );
        if pushed {
            self.mark_dispatched(&command, DeliveryChannel::Push).await?;
        }
        Ok(command)
    }

    /// Commands not yet acked, in FIFO order; each is marked dispatched.
    pub async fn pending(
        &self,
        lease: &LeaseRecord,
        via: DeliveryChannel,
    ) -> Result<Vec<Command>, CommandError> {
        let records = self.store.pending_commands(lease.lease_id).await?;
        if records.is_empty() {
            if via == DeliveryChannel::Poll
                && should_log_lease_event(LeaseLogKind::EmptyPoll, lease.lease_id)
            {
                debug!(lease_id = %lease.lease_id, "poll found no pending commands");
            }
            return Ok(Vec::new());
        }
        let mut commands = Vec::with_capacity(records.len());
        for record in records {
            self.mark_dispatched(&record.command, via).await?;
            commands.push(record.command);
        }
        Ok(commands)
    }

    pub async fn ack(
        &self,
        lease: &LeaseRecord,
        command_id: Uuid,
    ) -> Result<CommandRecord, CommandError> {
        self.owned(lease, command_id).await?;
        match self
            .store
            .advance_command(command_id, CommandState::Acked, None, self.clock.now_ms())
            .await?
        {
            AdvanceOutcome::Advanced(record) | AdvanceOutcome::Unchanged(record) => {
                if record.discarded {
                    return Err(CommandError::Discarded);
                }
                Ok(record)
            }
            AdvanceOutcome::NotFound => Err(CommandError::NotFound),
        }
    }

    /// Records the first result for a command. Later completions are accepted and
    /// ignored; the stored outcome is never overwritten.
    pub async fn complete(
        &self,
        lease: &LeaseRecord,
        command_id: Uuid,
        result: CommandResult,
    ) -> Result<Completion, CommandError> {
        self.owned(lease, command_id).await?;
        let status = result.status;
        match self
            .store
            .advance_command(
                command_id,
                CommandState::Completed,
                Some(result.clone()),
                self.clock.now_ms(),
            )
            .await?
        {
            AdvanceOutcome::Advanced(record) => {
                metrics::COMMANDS_COMPLETED
                    .with_label_values(&[status.as_str()])
                    .inc();
                info!(
                    lease_id = %lease.lease_id,
                    command_id = %command_id,
                    status = status.as_str(),
                    failure = result.failure.map(|kind| kind.as_str()).unwrap_or(""),
                    attempts = result.attempts,
                    "command completed"
                );
                Ok(Completion {
                    record,
                    first: true,
                })
            }
            AdvanceOutcome::Unchanged(record) if record.discarded => Err(CommandError::Discarded),
            AdvanceOutcome::Unchanged(record) => {
                metrics::DUPLICATE_COMPLETIONS.inc();
                if should_log_lease_event(LeaseLogKind::DuplicateComplete, lease.lease_id) {
                    let differs = record.result.as_ref() != Some(&result);
                    warn!(
                        lease_id = %lease.lease_id,
                        command_id = %command_id,
                        differs,
                        "duplicate completion ignored"
                    );
                }
                Ok(Completion {
                    record,
                    first: false,
                })
            }
            AdvanceOutcome::NotFound => Err(CommandError::NotFound),
        }
    }

    async fn owned(&self, lease: &LeaseRecord, command_id: Uuid) -> Result<(), CommandError> {
        match self.store.command(command_id).await? {
            Some(record) if record.command.lease_id == lease.lease_id => Ok(()),
            _ => Err(CommandError::NotFound),
        }
    }

    async fn mark_dispatched(
        &self,
        command: &Command,
        via: DeliveryChannel,
    ) -> Result<(), CommandError> {
        metrics::COMMANDS_DELIVERED
            .with_label_values(&[via.as_str()])
            .inc();
        if let AdvanceOutcome::NotFound = self
            .store
            .advance_command(
                command.id,
                CommandState::Dispatched,
                None,
                self.clock.now_ms(),
            )
            .await?
        {
            warn!(command_id = %command.id, "dispatched command vanished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        store::{LeaseEnd, LeaseStatus, MemoryStore},
    };
    use courier_proto::{ConnectionStatus, FailureKind, ModeratorId};

    fn lease(moderator_id: ModeratorId) -> LeaseRecord {
        LeaseRecord {
            lease_id: Uuid::new_v4(),
            device_id: format!("device-{moderator_id}"),
            device_name: "A".into(),
            moderator_id,
            token_hash: "t".into(),
            issued_at_ms: 0,
            expires_at_ms: 90_000,
            status: LeaseStatus::Active,
            ended_by: None,
            ended_at_ms: None,
            observed_status: ConnectionStatus::Connected,
            current_url: None,
        }
    }

    struct Fixture {
        queue: CommandQueue,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::new(0));
            let queue = CommandQueue::new(store.clone(), clock.clone(), ChannelRegistry::new());
            Self {
                queue,
                store,
                clock,
            }
        }

        async fn lease(&self, moderator_id: ModeratorId) -> LeaseRecord {
            let record = lease(moderator_id);
            self.store
                .acquire_lease(record.clone(), false, 0)
                .await
                .unwrap();
            record
        }
    }

    #[tokio::test]
    async fn poll_returns_fifo_until_acked() {
        let fixture = Fixture::new();
        let queue = &fixture.queue;
        let lease = fixture.lease(7).await;
        let first = queue
            .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
            .await
            .unwrap();
        let second = queue
            .enqueue(&lease, CommandType::RefreshPage, serde_json::Value::Null)
            .await
            .unwrap();

        let polled = queue.pending(&lease, DeliveryChannel::Poll).await.unwrap();
        assert_eq!(
            polled.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );

        queue.ack(&lease, first.id).await.unwrap();
        let polled = queue.pending(&lease, DeliveryChannel::Poll).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, second.id);
    }

    #[tokio::test]
    async fn push_goes_to_registered_channel() {
        let fixture = Fixture::new();
        let queue = &fixture.queue;
        let lease = fixture.lease(7).await;
        let (_conn, mut rx) = queue.channels().register(lease.lease_id);
        let command = queue
            .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
            .await
            .unwrap();
        match rx.recv().await {
            Some(ChannelEvent::ExecuteCommand { command: pushed }) => {
                assert_eq!(pushed.id, command.id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_completion_wins() {
        let fixture = Fixture::new();
        let queue = &fixture.queue;
        let lease = fixture.lease(7).await;
        let command = queue
            .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
            .await
            .unwrap();
        let first = queue
            .complete(&lease, command.id, CommandResult::sent(1, "double"))
            .await
            .unwrap();
        assert!(first.first);

        let again = queue
            .complete(&lease, command.id, CommandResult::sent(1, "double"))
            .await
            .unwrap();
        assert!(!again.first);

        let different = queue
            .complete(
                &lease,
                command.id,
                CommandResult::failed(FailureKind::Timeout, 3, "late"),
            )
            .await
            .unwrap();
        assert!(!different.first);
        assert_eq!(
            different.record.result,
            Some(CommandResult::sent(1, "double"))
        );
    }

    #[tokio::test]
    async fn other_leases_cannot_touch_a_command() {
        let fixture = Fixture::new();
        let queue = &fixture.queue;
        let lease = fixture.lease(7).await;
        let command = queue
            .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
            .await
            .unwrap();
        let stranger = fixture.lease(8).await;
        assert!(matches!(
            queue.ack(&stranger, command.id).await,
            Err(CommandError::NotFound)
        ));
    }

    #[tokio::test]
    async fn enqueue_refuses_a_lease_that_ended_after_lookup() {
        let fixture = Fixture::new();
        let lease = fixture.lease(7).await;
        fixture
            .store
            .end_lease(lease.lease_id, LeaseEnd::Released, 0)
            .await
            .unwrap();
        assert!(matches!(
            fixture
                .queue
                .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
                .await,
            Err(CommandError::LeaseEnded)
        ));
        assert!(fixture
            .store
            .pending_commands(lease.lease_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn enqueue_refuses_a_lapsed_lease() {
        let fixture = Fixture::new();
        let lease = fixture.lease(7).await;
        fixture.clock.advance_ms(lease.expires_at_ms);
        assert!(matches!(
            fixture
                .queue
                .enqueue(&lease, CommandType::GetStatus, serde_json::Value::Null)
                .await,
            Err(CommandError::LeaseEnded)
        ));
    }
}
