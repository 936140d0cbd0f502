use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use courier_proto::{FailureKind, ModeratorId};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{pause::ModeratorPause, RepositoryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    /// A command for this message is in flight.
    Dispatched,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub moderator_id: ModeratorId,
    pub session_id: Uuid,
    pub recipient: String,
    pub content: String,
    pub status: MessageStatus,
    pub paused: bool,
    pub attempts: u32,
    pub command_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// A message that exhausted its attempts or failed terminally, kept for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub message_id: Uuid,
    pub moderator_id: ModeratorId,
    pub session_id: Uuid,
    pub recipient: String,
    pub failure: Option<FailureKind>,
    pub detail: Option<String>,
    pub attempts: u32,
    pub failed_at_ms: i64,
}

/// Storage for the message-side entities the processor reads and mutates. Hosts with
/// their own patient queue implement this; [`InMemoryMessageRepository`] ships by default.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert_message(&self, message: Message) -> Result<(), RepositoryError>;
    async fn message(&self, message_id: Uuid) -> Result<Option<Message>, RepositoryError>;
    async fn update_message(&self, message: Message) -> Result<(), RepositoryError>;
    /// Queued messages of one moderator, oldest first.
    async fn queued_messages(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Vec<Message>, RepositoryError>;
    async fn moderators_with_queued(&self) -> Result<Vec<ModeratorId>, RepositoryError>;

    async fn set_session_paused(&self, session_id: Uuid, paused: bool)
        -> Result<(), RepositoryError>;
    async fn session_paused(&self, session_id: Uuid) -> Result<bool, RepositoryError>;

    async fn moderator_pause(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Option<ModeratorPause>, RepositoryError>;
    async fn set_moderator_pause(
        &self,
        moderator_id: ModeratorId,
        pause: Option<ModeratorPause>,
    ) -> Result<(), RepositoryError>;

    async fn record_failed_task(&self, task: FailedTask) -> Result<(), RepositoryError>;
    async fn failed_tasks(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Vec<FailedTask>, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    paused_sessions: HashSet<Uuid>,
    moderator_pauses: HashMap<ModeratorId, ModeratorPause>,
    failed: Vec<FailedTask>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn insert_message(&self, message: Message) -> Result<(), RepositoryError> {
        self.inner
            .write()
            .await
            .messages
            .insert(message.id, message);
        Ok(())
    }

    async fn message(&self, message_id: Uuid) -> Result<Option<Message>, RepositoryError> {
        Ok(self.inner.read().await.messages.get(&message_id).cloned())
    }

    async fn update_message(&self, message: Message) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&message.id) {
            Some(slot) => {
                *slot = message;
                Ok(())
            }
            None => Err(RepositoryError::MissingMessage(message.id)),
        }
    }

    async fn queued_messages(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut queued: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.moderator_id == moderator_id && m.status == MessageStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|m| (m.created_at_ms, m.id));
        Ok(queued)
    }

    async fn moderators_with_queued(&self) -> Result<Vec<ModeratorId>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut moderators: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Queued)
            .map(|m| m.moderator_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        moderators.sort_unstable();
        Ok(moderators)
    }

    async fn set_session_paused(
        &self,
        session_id: Uuid,
        paused: bool,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if paused {
            inner.paused_sessions.insert(session_id);
        } else {
            inner.paused_sessions.remove(&session_id);
        }
        Ok(())
    }

    async fn session_paused(&self, session_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.inner.read().await.paused_sessions.contains(&session_id))
    }

    async fn moderator_pause(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Option<ModeratorPause>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .moderator_pauses
            .get(&moderator_id)
            .cloned())
    }

    async fn set_moderator_pause(
        &self,
        moderator_id: ModeratorId,
        pause: Option<ModeratorPause>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        match pause {
            Some(pause) => inner.moderator_pauses.insert(moderator_id, pause),
            None => inner.moderator_pauses.remove(&moderator_id),
        };
        Ok(())
    }

    async fn record_failed_task(&self, task: FailedTask) -> Result<(), RepositoryError> {
        self.inner.write().await.failed.push(task);
        Ok(())
    }

    async fn failed_tasks(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Vec<FailedTask>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .failed
            .iter()
            .filter(|task| task.moderator_id == moderator_id)
            .cloned()
            .collect())
    }
}
