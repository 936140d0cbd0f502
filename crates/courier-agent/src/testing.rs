//! In-process fakes for the surface and the manager.

use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use courier_proto::{
    AcquireLeaseRequest, ChannelEvent, Command, CommandResult, ConnectionStatus, HeartbeatRequest,
    HeartbeatResponse, LeaseGrant, PairingCompleteRequest, PairingCompleteResponse,
    ReleaseLeaseRequest, SelfRevokeRequest,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    channel::PushChannel,
    client::{LeaseAuth, ManagerApi},
    config::Indicator,
    delivery::DeliveryMarker,
    surface::{AutomationSurface, SurfaceError},
    AgentError,
};

#[derive(Default)]
struct SurfaceState {
    visible: HashSet<String>,
    markers: VecDeque<DeliveryMarker>,
    url: String,
    redirect: Option<String>,
    closed: bool,
    fail_next: VecDeque<SurfaceError>,
    navigations: Vec<String>,
    fills: Vec<String>,
    enters: usize,
    artifacts: usize,
}

/// Selectors are the indicator names from `SelectorCatalog::for_tests`.
#[derive(Default)]
pub(crate) struct FakeSurface {
    state: Mutex<SurfaceState>,
}

impl FakeSurface {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut SurfaceState) -> T) -> T {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub(crate) fn show(&self, indicators: &[Indicator]) {
        self.with(|s| {
            s.visible
                .extend(indicators.iter().map(|i| i.as_str().to_string()))
        });
    }

    pub(crate) fn hide(&self, indicators: &[Indicator]) {
        self.with(|s| {
            for indicator in indicators {
                s.visible.remove(indicator.as_str());
            }
        });
    }

    /// Each full marker poll that lands on `Pending` advances the script by one step;
    /// the last entry sticks.
    pub(crate) fn script_markers(&self, markers: &[DeliveryMarker]) {
        self.with(|s| s.markers = markers.iter().copied().collect());
    }

    pub(crate) fn redirect_to(&self, url: &str) {
        self.with(|s| {
            s.redirect = Some(url.to_string());
            s.url = url.to_string();
        });
    }

    pub(crate) fn close(&self) {
        self.with(|s| s.closed = true);
    }

    pub(crate) fn fail_next(&self, err: SurfaceError) {
        self.with(|s| s.fail_next.push_back(err));
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        self.with(|s| s.navigations.clone())
    }

    pub(crate) fn fills(&self) -> Vec<String> {
        self.with(|s| s.fills.clone())
    }

    pub(crate) fn enters(&self) -> usize {
        self.with(|s| s.enters)
    }

    fn check(&self) -> Result<(), SurfaceError> {
        self.with(|s| {
            if s.closed {
                return Err(SurfaceError::Closed);
            }
            match s.fail_next.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

fn marker_for(selector: &str) -> Option<DeliveryMarker> {
    match selector {
        "marker_pending" => Some(DeliveryMarker::Pending),
        "marker_single" => Some(DeliveryMarker::Single),
        "marker_double" => Some(DeliveryMarker::Double),
        _ => None,
    }
}

#[async_trait]
impl AutomationSurface for FakeSurface {
    async fn is_alive(&self) -> bool {
        self.with(|s| !s.closed)
    }

    async fn current_url(&self) -> Result<String, SurfaceError> {
        self.check()?;
        Ok(self.with(|s| s.url.clone()))
    }

    async fn navigate(&self, url: &str) -> Result<(), SurfaceError> {
        self.check()?;
        self.with(|s| {
            s.navigations.push(url.to_string());
            s.url = s.redirect.clone().unwrap_or_else(|| url.to_string());
        });
        Ok(())
    }

    async fn reload(&self) -> Result<(), SurfaceError> {
        self.check()
    }

    async fn probe(&self, selectors: &[String]) -> Result<bool, SurfaceError> {
        self.check()?;
        Ok(self.with(|s| {
            selectors.iter().any(|selector| match marker_for(selector) {
                Some(marker) => {
                    let hit = s.markers.front() == Some(&marker);
                    if hit && marker == DeliveryMarker::Pending && s.markers.len() > 1 {
                        s.markers.pop_front();
                    }
                    hit
                }
                None => s.visible.contains(selector),
            })
        }))
    }

    async fn fill(&self, _selectors: &[String], text: &str) -> Result<(), SurfaceError> {
        self.check()?;
        self.with(|s| s.fills.push(text.to_string()));
        Ok(())
    }

    async fn click(&self, selectors: &[String]) -> Result<bool, SurfaceError> {
        self.check()?;
        Ok(self.with(|s| selectors.iter().any(|sel| s.visible.contains(sel))))
    }

    async fn press_enter(&self, _selectors: &[String]) -> Result<(), SurfaceError> {
        self.check()?;
        self.with(|s| s.enters += 1);
        Ok(())
    }

    async fn capture_debug_artifact(&self, label: &str) -> Result<String, SurfaceError> {
        Ok(self.with(|s| {
            s.artifacts += 1;
            format!("{label}-{}.png", s.artifacts)
        }))
    }
}

#[derive(Default)]
struct ManagerState {
    moderator_id: i64,
    grants: usize,
    conflict_holder: Option<String>,
    revoked: bool,
    expired: bool,
    heartbeats: Vec<ConnectionStatus>,
    pending: Vec<Command>,
    acked: Vec<Uuid>,
    completed: Vec<(Uuid, CommandResult)>,
    released: usize,
    push_enabled: bool,
    last_lease: Option<Uuid>,
    channel: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

/// Scriptable manager that records every call.
#[derive(Default)]
pub(crate) struct FakeManager {
    state: Mutex<ManagerState>,
}

impl FakeManager {
    pub(crate) fn new(moderator_id: i64) -> Self {
        let manager = Self::default();
        manager.with(|s| s.moderator_id = moderator_id);
        manager
    }

    fn with<T>(&self, f: impl FnOnce(&mut ManagerState) -> T) -> T {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub(crate) fn queue(&self, command: Command) {
        self.with(|s| s.pending.push(command));
    }

    pub(crate) fn hold_by(&self, holder: &str) {
        self.with(|s| s.conflict_holder = Some(holder.to_string()));
    }

    pub(crate) fn expire_leases(&self) {
        self.with(|s| s.expired = true);
    }

    pub(crate) fn revoke(&self) {
        self.with(|s| s.revoked = true);
    }

    pub(crate) fn last_lease(&self) -> Option<Uuid> {
        self.with(|s| s.last_lease)
    }

    pub(crate) fn enable_push(&self) {
        self.with(|s| s.push_enabled = true);
    }

    /// Delivers an event over the most recently opened channel.
    pub(crate) fn push(&self, event: ChannelEvent) -> bool {
        self.with(|s| {
            s.channel
                .as_ref()
                .map(|tx| tx.send(event).is_ok())
                .unwrap_or(false)
        })
    }

    pub(crate) fn heartbeats(&self) -> Vec<ConnectionStatus> {
        self.with(|s| s.heartbeats.clone())
    }

    pub(crate) fn acked(&self) -> Vec<Uuid> {
        self.with(|s| s.acked.clone())
    }

    pub(crate) fn completed(&self) -> Vec<(Uuid, CommandResult)> {
        self.with(|s| s.completed.clone())
    }

    pub(crate) fn released(&self) -> usize {
        self.with(|s| s.released)
    }

    fn guard(&self) -> Result<(), AgentError> {
        self.with(|s| {
            if s.revoked {
                Err(AgentError::Unauthenticated)
            } else if s.expired {
                Err(AgentError::LeaseExpired)
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl ManagerApi for FakeManager {
    async fn complete_pairing(
        &self,
        _request: &PairingCompleteRequest,
    ) -> Result<PairingCompleteResponse, AgentError> {
        Ok(self.with(|s| PairingCompleteResponse {
            device_credential: "credential-1".into(),
            moderator_id: s.moderator_id,
        }))
    }

    async fn acquire_lease(
        &self,
        _credential: &str,
        request: &AcquireLeaseRequest,
    ) -> Result<LeaseGrant, AgentError> {
        self.with(|s| {
            if s.revoked {
                return Err(AgentError::Unauthenticated);
            }
            if let Some(holder) = &s.conflict_holder {
                if !request.force_takeover {
                    return Err(AgentError::LeaseConflict {
                        current_device_name: holder.clone(),
                    });
                }
            }
            s.conflict_holder = None;
            s.expired = false;
            s.grants += 1;
            let lease_id = Uuid::new_v4();
            s.last_lease = Some(lease_id);
            Ok(LeaseGrant {
                lease_id,
                lease_token: format!("token-{}", s.grants),
                moderator_id: s.moderator_id,
                expires_at_ms: 90_000,
                heartbeat_interval_ms: 30_000,
            })
        })
    }

    async fn heartbeat(
        &self,
        _auth: &LeaseAuth,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError> {
        self.guard()?;
        self.with(|s| s.heartbeats.push(request.observed_status));
        Ok(HeartbeatResponse {
            expires_at_ms: 90_000,
        })
    }

    async fn release_lease(
        &self,
        _auth: &LeaseAuth,
        _request: &ReleaseLeaseRequest,
    ) -> Result<(), AgentError> {
        self.with(|s| s.released += 1);
        Ok(())
    }

    async fn self_revoke(
        &self,
        _credential: &str,
        _request: &SelfRevokeRequest,
    ) -> Result<(), AgentError> {
        self.revoke();
        Ok(())
    }

    async fn poll_commands(&self, _auth: &LeaseAuth) -> Result<Vec<Command>, AgentError> {
        self.guard()?;
        Ok(self.with(|s| {
            let acked = s.acked.clone();
            s.pending
                .iter()
                .filter(|c| !acked.contains(&c.id))
                .cloned()
                .collect()
        }))
    }

    async fn ack_command(&self, _auth: &LeaseAuth, command_id: Uuid) -> Result<(), AgentError> {
        self.guard()?;
        self.with(|s| s.acked.push(command_id));
        Ok(())
    }

    async fn complete_command(
        &self,
        _auth: &LeaseAuth,
        command_id: Uuid,
        result: &CommandResult,
    ) -> Result<(), AgentError> {
        self.guard()?;
        self.with(|s| s.completed.push((command_id, result.clone())));
        Ok(())
    }

    async fn open_channel(&self, _auth: &LeaseAuth) -> Result<PushChannel, AgentError> {
        self.with(|s| {
            if !s.push_enabled {
                return Err(AgentError::Channel("push disabled".into()));
            }
            let (channel, tx) = PushChannel::in_memory();
            s.channel = Some(tx);
            Ok(channel)
        })
    }
}
