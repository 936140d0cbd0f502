use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use courier_proto::{CommandResult, CommandState, ConnectionStatus, ModeratorId};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AcquireOutcome, AdvanceOutcome, CommandRecord, CourierStore, DeviceRecord, EndedLease,
    LeaseEnd, LeaseEvent, LeaseRecord, LeaseStatus, PairingCodeRecord, StoreResult,
};

/// Ended leases whose command history is still kept for late acks and lookups.
const RETAINED_ENDED_LEASES: usize = 256;
/// Lease audit events kept across all moderators.
const RETAINED_EVENTS: usize = 4096;

/// Everything lives behind one lock, so multi-table operations are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, DeviceRecord>,
    pairing_codes: HashMap<String, PairingCodeRecord>,
    leases: HashMap<Uuid, LeaseRecord>,
    active_by_moderator: HashMap<ModeratorId, Uuid>,
    commands: HashMap<Uuid, CommandRecord>,
    /// Enqueue order per lease.
    lease_commands: HashMap<Uuid, Vec<Uuid>>,
    /// Oldest first; past the cap their commands are dropped.
    ended_leases: VecDeque<Uuid>,
    events: VecDeque<LeaseEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn end_lease(&mut self, lease_id: Uuid, end: LeaseEnd, now_ms: i64) -> Option<EndedLease> {
        let lease = self.leases.get_mut(&lease_id)?;
        if lease.status != LeaseStatus::Active {
            return None;
        }
        lease.status = end.status();
        lease.ended_by = Some(end);
        lease.ended_at_ms = Some(now_ms);
        let lease = lease.clone();
        if self.active_by_moderator.get(&lease.moderator_id) == Some(&lease_id) {
            self.active_by_moderator.remove(&lease.moderator_id);
        }

        let mut discarded = Vec::new();
        for id in self.lease_commands.get(&lease_id).into_iter().flatten() {
            if let Some(record) = self.commands.get_mut(id) {
                if record.is_owed() {
                    record.discarded = true;
                    record.updated_at_ms = now_ms;
                    discarded.push(record.clone());
                }
            }
        }
        self.retire(lease_id);
        Some(EndedLease { lease, discarded })
    }

    fn retire(&mut self, lease_id: Uuid) {
        self.ended_leases.push_back(lease_id);
        while self.ended_leases.len() > RETAINED_ENDED_LEASES {
            let Some(oldest) = self.ended_leases.pop_front() else {
                break;
            };
            for id in self.lease_commands.remove(&oldest).unwrap_or_default() {
                self.commands.remove(&id);
            }
        }
    }
}

#[async_trait]
impl CourierStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert_device(&self, device: DeviceRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        Ok(self.inner.read().await.devices.get(device_id).cloned())
    }

    async fn device_by_credential(
        &self,
        credential_hash: &str,
    ) -> StoreResult<Option<DeviceRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .values()
            .find(|device| device.credential_hash == credential_hash)
            .cloned())
    }

    async fn revoke_device(
        &self,
        device_id: &str,
        now_ms: i64,
    ) -> StoreResult<Option<DeviceRecord>> {
        let mut inner = self.inner.write().await;
        Ok(inner.devices.get_mut(device_id).map(|device| {
            if !device.revoked {
                device.revoked = true;
                device.revoked_at_ms = Some(now_ms);
            }
            device.clone()
        }))
    }

    async fn devices_for_moderator(
        &self,
        moderator_id: ModeratorId,
    ) -> StoreResult<Vec<DeviceRecord>> {
        let inner = self.inner.read().await;
        let mut devices: Vec<_> = inner
            .devices
            .values()
            .filter(|device| device.moderator_id == moderator_id)
            .cloned()
            .collect();
        devices.sort_by_key(|device| device.paired_at_ms);
        Ok(devices)
    }

    async fn insert_pairing_code(&self, code: PairingCodeRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.pairing_codes.insert(code.code_hash.clone(), code);
        Ok(())
    }

    async fn consume_pairing_code(
        &self,
        code_hash: &str,
        now_ms: i64,
    ) -> StoreResult<Option<PairingCodeRecord>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .pairing_codes
            .remove(code_hash)
            .filter(|code| now_ms < code.expires_at_ms))
    }

    async fn acquire_lease(
        &self,
        candidate: LeaseRecord,
        force_takeover: bool,
        now_ms: i64,
    ) -> StoreResult<AcquireOutcome> {
        let mut inner = self.inner.write().await;
        let current = inner
            .active_by_moderator
            .get(&candidate.moderator_id)
            .and_then(|id| inner.leases.get(id))
            .cloned();

        let replaced = match current {
            Some(holder) if holder.is_live(now_ms) => {
                let same_device = holder.device_id == candidate.device_id;
                if !force_takeover && !same_device {
                    return Ok(AcquireOutcome::Conflict { holder });
                }
                inner.end_lease(holder.lease_id, LeaseEnd::TakenOver, now_ms)
            }
            Some(stale) => inner.end_lease(stale.lease_id, LeaseEnd::Expired, now_ms),
            None => None,
        };

        inner
            .active_by_moderator
            .insert(candidate.moderator_id, candidate.lease_id);
        inner.leases.insert(candidate.lease_id, candidate.clone());
        Ok(AcquireOutcome::Granted {
            lease: candidate,
            replaced,
        })
    }

    async fn lease(&self, lease_id: Uuid) -> StoreResult<Option<LeaseRecord>> {
        Ok(self.inner.read().await.leases.get(&lease_id).cloned())
    }

    async fn lease_by_token(&self, token_hash: &str) -> StoreResult<Option<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leases
            .values()
            .find(|lease| lease.token_hash == token_hash)
            .cloned())
    }

    async fn live_lease_for_moderator(
        &self,
        moderator_id: ModeratorId,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active_by_moderator
            .get(&moderator_id)
            .and_then(|id| inner.leases.get(id))
            .filter(|lease| lease.is_live(now_ms))
            .cloned())
    }

    async fn active_lease_for_device(&self, device_id: &str) -> StoreResult<Option<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active_by_moderator
            .values()
            .filter_map(|id| inner.leases.get(id))
            .find(|lease| lease.device_id == device_id)
            .cloned())
    }

    async fn renew_lease(
        &self,
        lease_id: Uuid,
        expires_at_ms: i64,
        observed_status: ConnectionStatus,
        current_url: Option<String>,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .leases
            .get_mut(&lease_id)
            .filter(|lease| lease.is_live(now_ms))
            .map(|lease| {
                lease.expires_at_ms = expires_at_ms;
                lease.observed_status = observed_status;
                lease.current_url = current_url;
                lease.clone()
            }))
    }

    async fn end_lease(
        &self,
        lease_id: Uuid,
        end: LeaseEnd,
        now_ms: i64,
    ) -> StoreResult<Option<EndedLease>> {
        Ok(self.inner.write().await.end_lease(lease_id, end, now_ms))
    }

    async fn leases_past_expiry(&self, now_ms: i64) -> StoreResult<Vec<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active_by_moderator
            .values()
            .filter_map(|id| inner.leases.get(id))
            .filter(|lease| lease.status == LeaseStatus::Active && !lease.is_live(now_ms))
            .cloned()
            .collect())
    }

    async fn insert_command(&self, record: CommandRecord, now_ms: i64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let live = inner
            .leases
            .get(&record.command.lease_id)
            .is_some_and(|lease| lease.is_live(now_ms));
        if !live {
            return Ok(false);
        }
        inner
            .lease_commands
            .entry(record.command.lease_id)
            .or_default()
            .push(record.id());
        inner.commands.insert(record.id(), record);
        Ok(true)
    }

    async fn command(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>> {
        Ok(self.inner.read().await.commands.get(&command_id).cloned())
    }

    async fn pending_commands(&self, lease_id: Uuid) -> StoreResult<Vec<CommandRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .lease_commands
            .get(&lease_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.commands.get(id))
            .filter(|record| !record.discarded && record.state.is_pending())
            .cloned()
            .collect())
    }

    async fn advance_command(
        &self,
        command_id: Uuid,
        to: CommandState,
        result: Option<CommandResult>,
        now_ms: i64,
    ) -> StoreResult<AdvanceOutcome> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.commands.get_mut(&command_id) else {
            return Ok(AdvanceOutcome::NotFound);
        };
        if record.discarded || to <= record.state {
            return Ok(AdvanceOutcome::Unchanged(record.clone()));
        }
        record.state = to;
        if record.result.is_none() {
            record.result = result;
        }
        record.updated_at_ms = now_ms;
        Ok(AdvanceOutcome::Advanced(record.clone()))
    }

    async fn append_event(&self, event: LeaseEvent) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.push_back(event);
        if inner.events.len() > RETAINED_EVENTS {
            inner.events.pop_front();
        }
        Ok(())
    }

    async fn lease_events(
        &self,
        moderator_id: ModeratorId,
        limit: usize,
    ) -> StoreResult<Vec<LeaseEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|event| event.moderator_id == moderator_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LeaseEventKind;
    use courier_proto::{Command, CommandType};

    fn lease(moderator_id: ModeratorId, device_id: &str, expires_at_ms: i64) -> LeaseRecord {
        LeaseRecord {
            lease_id: Uuid::new_v4(),
            device_id: device_id.into(),
            device_name: format!("{device_id}-name"),
            moderator_id,
            token_hash: "hash".into(),
            issued_at_ms: 0,
            expires_at_ms,
            status: LeaseStatus::Active,
            ended_by: None,
            ended_at_ms: None,
            observed_status: ConnectionStatus::Unknown,
            current_url: None,
        }
    }

    fn command(lease_id: Uuid) -> CommandRecord {
        CommandRecord::new(
            Command {
                id: Uuid::new_v4(),
                lease_id,
                command_type: CommandType::GetStatus,
                payload: serde_json::Value::Null,
                created_at_ms: 0,
            },
            7,
            0,
        )
    }

    #[tokio::test]
    async fn second_device_conflicts_until_forced() {
        let store = MemoryStore::new();
        let first = lease(7, "a", 1_000);
        store.acquire_lease(first.clone(), false, 0).await.unwrap();

        let outcome = store.acquire_lease(lease(7, "b", 1_000), false, 10).await.unwrap();
        match outcome {
            AcquireOutcome::Conflict { holder } => assert_eq!(holder.device_id, "a"),
            other => panic!("expected conflict, got {other:?}"),
        }

        let outcome = store.acquire_lease(lease(7, "b", 1_000), true, 20).await.unwrap();
        let AcquireOutcome::Granted { replaced, .. } = outcome else {
            panic!("expected grant");
        };
        let replaced = replaced.expect("prior lease ended");
        assert_eq!(replaced.lease.lease_id, first.lease_id);
        assert_eq!(replaced.lease.ended_by, Some(LeaseEnd::TakenOver));
        assert_eq!(replaced.lease.status, LeaseStatus::Released);
    }

    #[tokio::test]
    async fn stale_holder_never_blocks() {
        let store = MemoryStore::new();
        store.acquire_lease(lease(7, "a", 100), false, 0).await.unwrap();
        let outcome = store.acquire_lease(lease(7, "b", 500), false, 200).await.unwrap();
        let AcquireOutcome::Granted { replaced, .. } = outcome else {
            panic!("expected grant");
        };
        assert_eq!(replaced.unwrap().lease.ended_by, Some(LeaseEnd::Expired));
    }

    #[tokio::test]
    async fn renew_refuses_expired_lease() {
        let store = MemoryStore::new();
        let record = lease(7, "a", 100);
        store.acquire_lease(record.clone(), false, 0).await.unwrap();
        let renewed = store
            .renew_lease(record.lease_id, 500, ConnectionStatus::Connected, None, 100)
            .await
            .unwrap();
        assert!(renewed.is_none());
    }

    #[tokio::test]
    async fn ending_a_lease_discards_owed_commands_once() {
        let store = MemoryStore::new();
        let record = lease(7, "a", 1_000);
        store.acquire_lease(record.clone(), false, 0).await.unwrap();
        let owed = command(record.lease_id);
        let done = command(record.lease_id);
        assert!(store.insert_command(owed.clone(), 0).await.unwrap());
        assert!(store.insert_command(done.clone(), 0).await.unwrap());
        store
            .advance_command(done.id(), CommandState::Completed, None, 1)
            .await
            .unwrap();

        let ended = store
            .end_lease(record.lease_id, LeaseEnd::Released, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.discarded.len(), 1);
        assert_eq!(ended.discarded[0].id(), owed.id());
        assert!(store.pending_commands(record.lease_id).await.unwrap().is_empty());
        assert!(store
            .end_lease(record.lease_id, LeaseEnd::Released, 3)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn command_state_never_regresses() {
        let store = MemoryStore::new();
        let owner = lease(7, "a", 1_000);
        store.acquire_lease(owner.clone(), false, 0).await.unwrap();
        let record = command(owner.lease_id);
        assert!(store.insert_command(record.clone(), 0).await.unwrap());
        store
            .advance_command(record.id(), CommandState::Acked, None, 1)
            .await
            .unwrap();
        let outcome = store
            .advance_command(record.id(), CommandState::Dispatched, None, 2)
            .await
            .unwrap();
        match outcome {
            AdvanceOutcome::Unchanged(current) => assert_eq!(current.state, CommandState::Acked),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_for_ended_or_expired_leases_are_refused() {
        let store = MemoryStore::new();
        let record = lease(7, "a", 1_000);
        store.acquire_lease(record.clone(), false, 0).await.unwrap();

        assert!(!store.insert_command(command(record.lease_id), 1_000).await.unwrap());
        store
            .end_lease(record.lease_id, LeaseEnd::Released, 10)
            .await
            .unwrap();
        let late = command(record.lease_id);
        assert!(!store.insert_command(late.clone(), 20).await.unwrap());
        assert!(store.command(late.id()).await.unwrap().is_none());
        assert!(!store
            .insert_command(command(Uuid::new_v4()), 20)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn history_of_old_leases_is_bounded() {
        let store = MemoryStore::new();
        let mut first = None;
        for n in 0..=RETAINED_ENDED_LEASES {
            let record = lease(7, "a", 1_000_000);
            let now = n as i64;
            store.acquire_lease(record.clone(), false, now).await.unwrap();
            let sent = command(record.lease_id);
            assert!(store.insert_command(sent.clone(), now).await.unwrap());
            store
                .end_lease(record.lease_id, LeaseEnd::Released, now)
                .await
                .unwrap();
            first.get_or_insert(sent);
        }
        let first = first.unwrap();
        assert!(store.command(first.id()).await.unwrap().is_none());
        let inner = store.inner.read().await;
        assert_eq!(inner.ended_leases.len(), RETAINED_ENDED_LEASES);
        assert_eq!(inner.commands.len(), RETAINED_ENDED_LEASES);
        assert_eq!(inner.lease_commands.len(), RETAINED_ENDED_LEASES);
    }

    #[tokio::test]
    async fn event_log_keeps_the_newest() {
        let store = MemoryStore::new();
        for n in 0..RETAINED_EVENTS + 10 {
            store
                .append_event(LeaseEvent {
                    id: Uuid::new_v4(),
                    moderator_id: 7,
                    lease_id: Uuid::new_v4(),
                    device_id: "a".into(),
                    kind: LeaseEventKind::StatusChanged,
                    detail: None,
                    at_ms: n as i64,
                })
                .await
                .unwrap();
        }
        let events = store.lease_events(7, usize::MAX).await.unwrap();
        assert_eq!(events.len(), RETAINED_EVENTS);
        assert_eq!(events[0].at_ms, (RETAINED_EVENTS + 9) as i64);
        assert_eq!(events.last().unwrap().at_ms, 10);
    }

    #[tokio::test]
    async fn pairing_codes_are_single_use() {
        let store = MemoryStore::new();
        store
            .insert_pairing_code(PairingCodeRecord {
                code_hash: "h".into(),
                moderator_id: 7,
                expires_at_ms: 100,
            })
            .await
            .unwrap();
        assert!(store.consume_pairing_code("h", 10).await.unwrap().is_some());
        assert!(store.consume_pairing_code("h", 10).await.unwrap().is_none());
    }
}
