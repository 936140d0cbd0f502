//! The agent's main loop: one lease, one surface, one command at a time.

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_proto::{
    AcquireLeaseRequest, ChannelEvent, CheckNumberPayload, Command, CommandResult, CommandType,
    ConnectionStatus, FailureKind, HeartbeatRequest, LeaseGrant, ModeratorId, NavigatePayload,
    PairingCompleteRequest, ReleaseLeaseRequest, ResultStatus, SelfRevokeRequest,
    SendMessagePayload,
};
use futures_util::future::OptionFuture;
use serde_json::json;
use tokio::{
    sync::{watch, Notify},
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    channel::PushChannel,
    client::{LeaseAuth, ManagerApi},
    config::AgentConfig,
    dedup::ProcessedIds,
    delivery::DeliveryStateMachine,
    persist::{PersistedAgentState, PersistedLease, StateFile},
    status::StatusDetector,
    surface::{AutomationSurface, SurfaceError},
    AgentError,
};

type Job = Pin<Box<dyn Future<Output = CommandResult> + Send>>;

const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AgentRuntime<A, S> {
    config: AgentConfig,
    api: Arc<A>,
    surface: Arc<S>,
    state_file: StateFile,
    persisted: PersistedAgentState,
    detector: StatusDetector,
    delivery: DeliveryStateMachine,
    status: ConnectionStatus,
    queue: VecDeque<Command>,
    processed: ProcessedIds,
    channel: Option<PushChannel>,
    heartbeat_every: Duration,
    resume_at: Option<Instant>,
    status_nudge: Arc<Notify>,
}

impl<A, S> AgentRuntime<A, S>
where
    A: ManagerApi + 'static,
    S: AutomationSurface + 'static,
{
    /// Loads persisted state; nothing is sent to the manager yet.
    pub fn new(config: AgentConfig, api: Arc<A>, surface: Arc<S>) -> Result<Self, AgentError> {
        let state_file = StateFile::new(config.resolved_state_path()?);
        let mut persisted = state_file.load()?;
        if persisted.device_name.is_empty() {
            persisted.device_name = config.device_name.clone();
        }
        let catalog = Arc::new(config.catalog.clone());
        Ok(Self {
            detector: StatusDetector::new(catalog.clone()),
            delivery: DeliveryStateMachine::new(catalog, config.delivery.clone()),
            processed: ProcessedIds::new(config.processed_capacity),
            heartbeat_every: config.heartbeat_interval(),
            config,
            api,
            surface,
            state_file,
            persisted,
            status: ConnectionStatus::Unknown,
            queue: VecDeque::new(),
            channel: None,
            resume_at: None,
            status_nudge: Arc::new(Notify::new()),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn persisted(&self) -> &PersistedAgentState {
        &self.persisted
    }

    /// Commands received but not yet started.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle the host fires when the surface changed (for example a DOM mutation), so
    /// status is re-evaluated before the next status tick.
    pub fn status_trigger(&self) -> Arc<Notify> {
        self.status_nudge.clone()
    }

    pub fn has_lease(&self) -> bool {
        self.persisted.lease.is_some()
    }

    fn lease_auth(&self) -> Option<LeaseAuth> {
        let credential = self.persisted.credential.clone()?;
        let lease = self.persisted.lease.as_ref()?;
        Some(LeaseAuth {
            credential,
            lease_id: lease.lease_id,
            lease_token: lease.lease_token.clone(),
        })
    }

    fn save(&self) {
        if let Err(err) = self.state_file.save(&self.persisted) {
            warn!(
                target: "courier.agent",
                path = %self.state_file.path().display(),
                error = %err,
                "failed to persist agent state"
            );
        }
    }

    /// Exchanges a pairing code for a device credential.
    pub async fn pair(
        &mut self,
        pairing_code: &str,
        device_id: &str,
    ) -> Result<ModeratorId, AgentError> {
        let response = self
            .api
            .complete_pairing(&PairingCompleteRequest {
                pairing_code: pairing_code.to_string(),
                device_id: device_id.to_string(),
                device_name: self.persisted.device_name.clone(),
                client_version: CLIENT_VERSION.to_string(),
            })
            .await?;
        self.persisted.device_id = device_id.to_string();
        self.persisted.credential = Some(response.device_credential);
        self.persisted.moderator_id = Some(response.moderator_id);
        self.persisted.lease = None;
        self.queue.clear();
        self.channel = None;
        self.state_file.save(&self.persisted)?;
        info!(
            target: "courier.agent",
            device_id,
            moderator_id = response.moderator_id,
            "device paired"
        );
        Ok(response.moderator_id)
    }

    /// Acquires the moderator's lease and tries to open the push channel.
    /// A conflict is returned as is; retry with `force` to take the lease over.
    pub async fn acquire_lease(&mut self, force: bool) -> Result<LeaseGrant, AgentError> {
        let credential = self
            .persisted
            .credential
            .clone()
            .ok_or(AgentError::NotPaired)?;
        let request = AcquireLeaseRequest {
            device_id: self.persisted.device_id.clone(),
            force_takeover: force,
        };
        let grant = match self.api.acquire_lease(&credential, &request).await {
            Ok(grant) => grant,
            Err(err) => return Err(self.on_error(err)),
        };
        self.persisted.lease = Some(PersistedLease {
            lease_id: grant.lease_id,
            lease_token: grant.lease_token.clone(),
        });
        self.persisted.moderator_id = Some(grant.moderator_id);
        self.queue.clear();
        if grant.heartbeat_interval_ms > 0 {
            self.heartbeat_every = Duration::from_millis(grant.heartbeat_interval_ms.max(1_000));
        }
        self.save();
        info!(
            target: "courier.agent",
            lease_id = %grant.lease_id,
            moderator_id = grant.moderator_id,
            force,
            "lease acquired"
        );
        self.connect_channel().await;
        Ok(grant)
    }

    pub async fn release_lease(&mut self, reason: &str) -> Result<(), AgentError> {
        let auth = self.lease_auth().ok_or(AgentError::NoLease)?;
        let outcome = self
            .api
            .release_lease(
                &auth,
                &ReleaseLeaseRequest {
                    reason: Some(reason.to_string()),
                },
            )
            .await;
        self.drop_lease();
        self.save();
        info!(target: "courier.agent", lease_id = %auth.lease_id, reason, "lease released");
        outcome
    }

    /// Revokes this device's own credential. The agent has to pair again afterwards.
    pub async fn self_revoke(&mut self, reason: &str) -> Result<(), AgentError> {
        let credential = self
            .persisted
            .credential
            .clone()
            .ok_or(AgentError::NotPaired)?;
        self.api
            .self_revoke(
                &credential,
                &SelfRevokeRequest {
                    reason: Some(reason.to_string()),
                },
            )
            .await?;
        self.drop_lease();
        self.persisted.wipe_credential();
        self.save();
        info!(target: "courier.agent", reason, "device revoked itself");
        Ok(())
    }

    async fn connect_channel(&mut self) {
        let Some(auth) = self.lease_auth() else {
            return;
        };
        match self.api.open_channel(&auth).await {
            Ok(channel) => {
                debug!(target: "courier.channel", lease_id = %auth.lease_id, "push channel open");
                self.channel = Some(channel);
            }
            Err(err) => {
                debug!(
                    target: "courier.channel",
                    lease_id = %auth.lease_id,
                    error = %err,
                    "push channel unavailable; polling"
                );
                self.channel = None;
            }
        }
    }

    fn drop_lease(&mut self) {
        self.persisted.lease = None;
        self.queue.clear();
        self.channel = None;
        self.resume_at = None;
    }

    /// Applies the local consequences of a manager error and hands it back.
    fn on_error(&mut self, err: AgentError) -> AgentError {
        match &err {
            AgentError::LeaseExpired => {
                warn!(
                    target: "courier.agent",
                    dropped = self.queue.len(),
                    "lease expired; local queue discarded"
                );
                self.drop_lease();
                self.save();
            }
            AgentError::Unauthenticated => {
                warn!(target: "courier.agent", "credential rejected; pairing required");
                self.drop_lease();
                self.persisted.wipe_credential();
                self.save();
            }
            _ => {}
        }
        err
    }

    /// Buffers a command unless it was seen before. Push and poll may both deliver it.
    pub fn receive(&mut self, command: Command) -> bool {
        if !self.processed.insert(command.id) {
            debug!(target: "courier.agent", command_id = %command.id, "duplicate command ignored");
            return false;
        }
        debug!(
            target: "courier.agent",
            command_id = %command.id,
            command_type = command.command_type.as_str(),
            queued = self.queue.len() + 1,
            "command buffered"
        );
        self.queue.push_back(command);
        true
    }

    /// Fetches pending commands; returns how many were new.
    pub async fn poll_once(&mut self) -> Result<usize, AgentError> {
        let auth = self.lease_auth().ok_or(AgentError::NoLease)?;
        let commands = match self.api.poll_commands(&auth).await {
            Ok(commands) => commands,
            Err(err) => return Err(self.on_error(err)),
        };
        Ok(commands
            .into_iter()
            .filter(|command| command.lease_id == auth.lease_id)
            .map(|command| self.receive(command))
            .filter(|fresh| *fresh)
            .count())
    }

    pub async fn heartbeat_once(&mut self) -> Result<(), AgentError> {
        let auth = self.lease_auth().ok_or(AgentError::NoLease)?;
        let request = HeartbeatRequest {
            observed_status: self.status,
            current_url: self.surface.current_url().await.ok(),
        };
        match self.api.heartbeat(&auth, &request).await {
            Ok(response) => {
                debug!(
                    target: "courier.agent",
                    status = self.status.as_str(),
                    expires_at_ms = response.expires_at_ms,
                    "heartbeat accepted"
                );
                Ok(())
            }
            Err(err) => Err(self.on_error(err)),
        }
    }

    /// Re-evaluates the surface. A change is persisted and reported straight away.
    pub async fn observe_status(&mut self) -> Result<ConnectionStatus, AgentError> {
        let observed = self.detector.detect(&*self.surface).await;
        if observed == self.status {
            return Ok(observed);
        }
        info!(
            target: "courier.agent",
            from = self.status.as_str(),
            to = observed.as_str(),
            queued = self.queue.len(),
            "surface status changed"
        );
        self.status = observed;
        if self.persisted.was_connected != observed.is_connected() {
            self.persisted.was_connected = observed.is_connected();
            self.save();
        }
        if self.has_lease() {
            self.heartbeat_once().await?;
        }
        Ok(observed)
    }

    /// Acks the next buffered command and returns its execution future. Nothing starts
    /// while the surface is not connected or the inter-command pause is running.
    async fn start_next(&mut self) -> Result<Option<(Command, Job)>, AgentError> {
        if !self.status.is_connected() || self.queue.is_empty() {
            return Ok(None);
        }
        if let Some(at) = self.resume_at {
            if Instant::now() < at {
                return Ok(None);
            }
            self.resume_at = None;
        }
        let auth = self.lease_auth().ok_or(AgentError::NoLease)?;
        let Some(command) = self.queue.pop_front() else {
            return Ok(None);
        };
        if let Err(err) = self.api.ack_command(&auth, command.id).await {
            if err.loses_lease() {
                return Err(self.on_error(err));
            }
            warn!(target: "courier.agent", command_id = %command.id, error = %err, "ack failed");
        }
        info!(
            target: "courier.agent",
            command_id = %command.id,
            command_type = command.command_type.as_str(),
            "executing command"
        );
        let job: Job = Box::pin(execute(
            self.surface.clone(),
            self.delivery.clone(),
            self.detector.clone(),
            command.clone(),
        ));
        Ok(Some((command, job)))
    }

    async fn finish(&mut self, command: &Command, result: &CommandResult) -> Result<(), AgentError> {
        self.resume_at = Some(Instant::now() + self.config.inter_command_delay());
        info!(
            target: "courier.agent",
            command_id = %command.id,
            status = result.status.as_str(),
            attempts = result.attempts,
            "command finished"
        );
        let Some(auth) = self.lease_auth().filter(|auth| auth.lease_id == command.lease_id) else {
            debug!(target: "courier.agent", command_id = %command.id, "result for a lost lease dropped");
            return Ok(());
        };
        match self.api.complete_command(&auth, command.id, result).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.on_error(err)),
        }
    }

    /// Runs the next buffered command to completion, if one may start now.
    pub async fn process_next(&mut self) -> Result<Option<CommandResult>, AgentError> {
        let Some((command, job)) = self.start_next().await? else {
            return Ok(None);
        };
        let result = job.await;
        self.finish(&command, &result).await?;
        Ok(Some(result))
    }

    /// Drives the agent until `shutdown` flips to true or the session cannot continue.
    /// Heartbeats and polling keep running while a command executes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        if !self.persisted.is_paired() {
            return Err(AgentError::NotPaired);
        }
        self.resume_lease().await?;
        self.observe_status().await?;

        let mut heartbeat = interval(self.heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = interval(self.config.status_interval());
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<(Command, Job)> = None;
        let nudge = self.status_nudge.clone();

        let outcome = loop {
            if in_flight.is_none() {
                match self.start_next().await {
                    Ok(next) => in_flight = next,
                    Err(err) => match self.recover(err).await {
                        Ok(()) => continue,
                        Err(err) => break Err(err),
                    },
                }
            }
            let wake = self
                .resume_at
                .filter(|_| in_flight.is_none() && !self.queue.is_empty());

            let step = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                    Ok(())
                }
                Some(result) = OptionFuture::from(in_flight.as_mut().map(|(_, job)| job)), if in_flight.is_some() => {
                    match in_flight.take() {
                        Some((command, _)) => self.finish(&command, &result).await,
                        None => Ok(()),
                    }
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.resume_at = None;
                    Ok(())
                }
                event = next_event(&mut self.channel), if self.channel.is_some() => {
                    self.on_channel_event(event)
                }
                _ = heartbeat.tick() => {
                    if let Some(channel) = &self.channel {
                        channel.ping();
                    }
                    self.heartbeat_once().await
                }
                _ = poll.tick() => {
                    if self.channel.is_none() {
                        self.connect_channel().await;
                    }
                    self.poll_once().await.map(|_| ())
                }
                _ = status.tick() => self.observe_status().await.map(|_| ()),
                _ = nudge.notified() => self.observe_status().await.map(|_| ()),
            };

            if let Err(err) = step {
                if err.loses_lease() || matches!(err, AgentError::Invalidated { .. }) {
                    in_flight = None;
                }
                if let Err(err) = self.recover(err).await {
                    break Err(err);
                }
            }
        };

        if self.has_lease() {
            if let Err(err) = self.release_lease("agent shutdown").await {
                debug!(target: "courier.agent", error = %err, "release on shutdown failed");
            }
        }
        self.save();
        outcome
    }

    /// Uses a lease restored from disk when the manager still honours it.
    async fn resume_lease(&mut self) -> Result<(), AgentError> {
        if self.has_lease() {
            match self.heartbeat_once().await {
                Ok(()) => {
                    info!(target: "courier.agent", "resumed persisted lease");
                    self.connect_channel().await;
                    return Ok(());
                }
                Err(AgentError::LeaseExpired) => {}
                Err(err) => return Err(err),
            }
        }
        self.acquire_lease(false).await.map(|_| ())
    }

    /// Decides whether the loop survives an error. Expired leases are re-acquired without
    /// forcing; everything that needs an operator or a new pairing ends the loop.
    async fn recover(&mut self, err: AgentError) -> Result<(), AgentError> {
        match err {
            AgentError::LeaseExpired => self.acquire_lease(false).await.map(|_| ()),
            AgentError::Unauthenticated
            | AgentError::Invalidated { .. }
            | AgentError::NotPaired
            | AgentError::LeaseConflict { .. }
            | AgentError::Persist(_) => Err(err),
            other => {
                warn!(target: "courier.agent", error = %other, "manager call failed; continuing");
                Ok(())
            }
        }
    }

    fn on_channel_event(&mut self, event: Option<ChannelEvent>) -> Result<(), AgentError> {
        match event {
            Some(ChannelEvent::Registered { pending }) => {
                let fresh = pending
                    .into_iter()
                    .map(|command| self.receive(command))
                    .filter(|fresh| *fresh)
                    .count();
                debug!(target: "courier.channel", fresh, "channel registered");
                Ok(())
            }
            Some(ChannelEvent::ExecuteCommand { command }) => {
                self.receive(command);
                Ok(())
            }
            Some(ChannelEvent::SessionInvalidated { reason }) => {
                warn!(target: "courier.channel", %reason, "session invalidated by manager");
                self.drop_lease();
                self.save();
                Err(AgentError::Invalidated { reason })
            }
            None => {
                debug!(target: "courier.channel", "push channel dropped; polling");
                self.channel = None;
                Ok(())
            }
        }
    }
}

async fn next_event(channel: &mut Option<PushChannel>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => None,
    }
}

async fn execute<S: AutomationSurface + ?Sized>(
    surface: Arc<S>,
    delivery: DeliveryStateMachine,
    detector: StatusDetector,
    command: Command,
) -> CommandResult {
    match command.command_type {
        CommandType::SendMessage => match command.payload_as::<SendMessagePayload>() {
            Ok(payload) => delivery.send_message(&*surface, &payload).await,
            Err(err) => bad_payload(&command, err),
        },
        CommandType::CheckWhatsAppNumber => match command.payload_as::<CheckNumberPayload>() {
            Ok(payload) => delivery.check_number(&*surface, &payload).await,
            Err(err) => bad_payload(&command, err),
        },
        CommandType::RefreshPage => match surface.reload().await {
            Ok(()) => CommandResult::succeeded(json!({ "reloaded": true })),
            Err(err) => surface_failure(err),
        },
        CommandType::GetStatus => {
            let status = detector.detect(&*surface).await;
            let current_url = surface.current_url().await.ok();
            CommandResult::succeeded(json!({ "status": status, "current_url": current_url }))
        }
        CommandType::Navigate => match command.payload_as::<NavigatePayload>() {
            Ok(payload) => match surface.navigate(&payload.url).await {
                Ok(()) => CommandResult::succeeded(json!({ "url": payload.url })),
                Err(err) => surface_failure(err),
            },
            Err(err) => bad_payload(&command, err),
        },
    }
}

fn bad_payload(command: &Command, err: serde_json::Error) -> CommandResult {
    CommandResult::failed(
        FailureKind::Unsupported,
        0,
        format!("{} payload rejected: {err}", command.command_type.as_str()),
    )
}

fn surface_failure(err: SurfaceError) -> CommandResult {
    match err {
        SurfaceError::Closed => {
            CommandResult::scope(ResultStatus::SurfaceClosed, 1, "automation surface closed")
        }
        SurfaceError::Fatal(detail) => CommandResult::failed(FailureKind::RuntimeFault, 1, detail),
        SurfaceError::NotFound(detail) => {
            CommandResult::failed(FailureKind::ElementNotFound, 1, detail)
        }
        SurfaceError::Transient(detail) => CommandResult::failed(FailureKind::Timeout, 1, detail),
    }
}
