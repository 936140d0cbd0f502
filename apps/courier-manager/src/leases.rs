use std::sync::Arc;

use courier_proto::{ConnectionStatus, LeaseGrant, ModeratorId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    metrics, secrets,
    store::{
        AcquireOutcome, CourierStore, DeviceRecord, EndedLease, LeaseEnd, LeaseEvent,
        LeaseEventKind, LeaseRecord, LeaseStatus, StoreError,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("device credential is unknown or revoked")]
    Unauthenticated,
    #[error("lease token does not belong to this device or lease")]
    Forbidden,
    #[error("lease has expired or ended")]
    LeaseExpired,
    #[error("lease held by {current_device_name}")]
    Conflict { current_device_name: String },
    #[error("no active lease")]
    NoActiveLease,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful acquisition. The raw token is only ever available here.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub grant: LeaseGrant,
    pub lease: LeaseRecord,
    pub replaced: Option<EndedLease>,
}

#[derive(Debug, Clone)]
pub struct Renewed {
    pub lease: LeaseRecord,
    pub previous_status: ConnectionStatus,
}

impl Renewed {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.lease.observed_status
    }
}

/// Grants one live lease per moderator and tracks its liveness.
pub struct LeaseManager {
    store: Arc<dyn CourierStore>,
    clock: SharedClock,
    ttl_ms: i64,
    heartbeat_interval_ms: u64,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn CourierStore>,
        clock: SharedClock,
        ttl_ms: u64,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            ttl_ms: ttl_ms as i64,
            heartbeat_interval_ms,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Resolves a raw device credential to a non-revoked identity.
    pub async fn authenticate_device(&self, credential: &str) -> Result<DeviceRecord, LeaseError> {
        let device = self
            .store
            .device_by_credential(&secrets::digest(credential))
            .await?
            .ok_or(LeaseError::Unauthenticated)?;
        if device.revoked {
            return Err(LeaseError::Unauthenticated);
        }
        Ok(device)
    }

    pub async fn acquire(
        &self,
        device: &DeviceRecord,
        force_takeover: bool,
    ) -> Result<Acquired, LeaseError> {
        let now = self.now_ms();
        let token = secrets::new_lease_token();
        let candidate = LeaseRecord {
            lease_id: Uuid::new_v4(),
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            moderator_id: device.moderator_id,
            token_hash: secrets::digest(&token),
            issued_at_ms: now,
            expires_at_ms: now + self.ttl_ms,
            status: LeaseStatus::Active,
            ended_by: None,
            ended_at_ms: None,
            observed_status: ConnectionStatus::Unknown,
            current_url: None,
        };

        match self
            .store
            .acquire_lease(candidate, force_takeover, now)
            .await?
        {
            AcquireOutcome::Conflict { holder } => {
                metrics::LEASE_CONFLICTS.inc();
                info!(
                    moderator_id = device.moderator_id,
                    device_id = %device.device_id,
                    holder_device_id = %holder.device_id,
                    "lease conflict"
                );
                Err(LeaseError::Conflict {
                    current_device_name: holder.device_name,
                })
            }
            AcquireOutcome::Granted { lease, replaced } => {
                if let Some(ended) = &replaced {
                    self.note_ended(ended, Some("superseded by new acquisition"))
                        .await;
                }
                self.record_event(&lease, LeaseEventKind::Acquired, None)
                    .await;
                metrics::LEASES_ACQUIRED.inc();
                info!(
                    moderator_id = lease.moderator_id,
                    lease_id = %lease.lease_id,
                    device_id = %lease.device_id,
                    force_takeover,
                    "lease acquired"
                );
                Ok(Acquired {
                    grant: LeaseGrant {
                        lease_id: lease.lease_id,
                        lease_token: token,
                        moderator_id: lease.moderator_id,
                        expires_at_ms: lease.expires_at_ms,
                        heartbeat_interval_ms: self.heartbeat_interval_ms,
                    },
                    lease,
                    replaced,
                })
            }
        }
    }

    /// Validates a lease token for an already-authenticated device. The credential and
    /// the token are checked independently: the token must exist, belong to this device
    /// (and to `expected_lease` when given), and its lease must still be live.
    pub async fn authorize(
        &self,
        device: &DeviceRecord,
        token: &str,
        expected_lease: Option<Uuid>,
    ) -> Result<LeaseRecord, LeaseError> {
        let lease = self
            .store
            .lease_by_token(&secrets::digest(token))
            .await?
            .ok_or(LeaseError::Unauthenticated)?;
        if lease.device_id != device.device_id {
            return Err(LeaseError::Forbidden);
        }
        if expected_lease.is_some_and(|id| id != lease.lease_id) {
            return Err(LeaseError::Forbidden);
        }
        if !lease.is_live(self.now_ms()) {
            return Err(LeaseError::LeaseExpired);
        }
        Ok(lease)
    }

    pub async fn heartbeat(
        &self,
        lease: &LeaseRecord,
        observed_status: ConnectionStatus,
        current_url: Option<String>,
    ) -> Result<Renewed, LeaseError> {
        let now = self.now_ms();
        let renewed = self
            .store
            .renew_lease(
                lease.lease_id,
                now + self.ttl_ms,
                observed_status,
                current_url,
                now,
            )
            .await?
            .ok_or(LeaseError::LeaseExpired)?;
        let renewed = Renewed {
            lease: renewed,
            previous_status: lease.observed_status,
        };
        if renewed.status_changed() {
            let detail = format!("{} -> {}", renewed.previous_status, observed_status);
            self.record_event(&renewed.lease, LeaseEventKind::StatusChanged, Some(detail))
                .await;
        }
        debug!(
            lease_id = %lease.lease_id,
            status = %observed_status,
            expires_at_ms = renewed.lease.expires_at_ms,
            "heartbeat"
        );
        Ok(renewed)
    }

    /// Idempotent: an unknown, already released or expired lease is a no-op.
    pub async fn release(
        &self,
        device: &DeviceRecord,
        lease_id: Uuid,
        token: &str,
        reason: Option<&str>,
    ) -> Result<Option<EndedLease>, LeaseError> {
        let Some(lease) = self.store.lease(lease_id).await? else {
            return Ok(None);
        };
        if lease.device_id != device.device_id || lease.token_hash != secrets::digest(token) {
            return Err(LeaseError::Forbidden);
        }
        let ended = self
            .store
            .end_lease(lease_id, LeaseEnd::Released, self.now_ms())
            .await?;
        if let Some(ended) = &ended {
            self.note_ended(ended, reason).await;
        }
        Ok(ended)
    }

    /// Force-expires whatever lease the device currently holds.
    pub async fn revoke_device_lease(
        &self,
        device_id: &str,
        reason: &str,
    ) -> Result<Option<EndedLease>, LeaseError> {
        let Some(lease) = self.store.active_lease_for_device(device_id).await? else {
            return Ok(None);
        };
        let ended = self
            .store
            .end_lease(lease.lease_id, LeaseEnd::Revoked, self.now_ms())
            .await?;
        if let Some(ended) = &ended {
            self.note_ended(ended, Some(reason)).await;
        }
        Ok(ended)
    }

    /// Eagerly ends every active lease whose expiry has passed.
    pub async fn sweep_expired(&self) -> Result<Vec<EndedLease>, LeaseError> {
        let now = self.now_ms();
        let mut swept = Vec::new();
        for lease in self.store.leases_past_expiry(now).await? {
            if let Some(ended) = self
                .store
                .end_lease(lease.lease_id, LeaseEnd::Expired, now)
                .await?
            {
                self.note_ended(&ended, Some("heartbeat window elapsed"))
                    .await;
                swept.push(ended);
            }
        }
        Ok(swept)
    }

    /// A lease usable for new commands right now.
    pub async fn require_live(&self, lease_id: Uuid) -> Result<LeaseRecord, LeaseError> {
        self.store
            .lease(lease_id)
            .await?
            .filter(|lease| lease.is_live(self.now_ms()))
            .ok_or(LeaseError::NoActiveLease)
    }

    pub async fn live_lease_for_moderator(
        &self,
        moderator_id: ModeratorId,
    ) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self
            .store
            .live_lease_for_moderator(moderator_id, self.now_ms())
            .await?)
    }

    pub async fn events(
        &self,
        moderator_id: ModeratorId,
        limit: usize,
    ) -> Result<Vec<LeaseEvent>, LeaseError> {
        Ok(self.store.lease_events(moderator_id, limit).await?)
    }

    async fn note_ended(&self, ended: &EndedLease, reason: Option<&str>) {
        let end = ended.lease.ended_by.unwrap_or(LeaseEnd::Expired);
        metrics::LEASES_ENDED.with_label_values(&[end.as_str()]).inc();
        metrics::COMMANDS_DISCARDED.inc_by(ended.discarded.len() as u64);
        crate::log_throttle::forget_lease(ended.lease.lease_id);
        info!(
            moderator_id = ended.lease.moderator_id,
            lease_id = %ended.lease.lease_id,
            device_id = %ended.lease.device_id,
            end = end.as_str(),
            discarded = ended.discarded.len(),
            reason = reason.unwrap_or(""),
            "lease ended"
        );
        self.record_event(&ended.lease, end.into(), reason.map(str::to_string))
            .await;
    }

    async fn record_event(&self, lease: &LeaseRecord, kind: LeaseEventKind, detail: Option<String>) {
        let event = LeaseEvent {
            id: Uuid::new_v4(),
            moderator_id: lease.moderator_id,
            lease_id: lease.lease_id,
            device_id: lease.device_id.clone(),
            kind,
            detail,
            at_ms: self.now_ms(),
        };
        if let Err(err) = self.store.append_event(event).await {
            warn!(lease_id = %lease.lease_id, error = %err, "failed to record lease event");
        }
    }
}
