//! The session engine actor.
//!
//! [`SessionEngine::spawn`] starts the session (credential fetch, channel
//! join, capture acquisition, wake lock, renewal task) and returns a
//! cloneable [`SessionEngineHandle`]. The actor owns every mutable piece of
//! session state and processes one message or collaborator event at a
//! time, so fallback transitions are serialized by construction.
//!
//! Collaborator events (transport connection state, quality reports, chat
//! lifecycle) arrive on channels handed in at spawn; the engine never
//! polls its collaborators.

use crate::chat::{ChatChannel, ChatEvent};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::{EventKind, FallbackEvent, FallbackEventBus};
use crate::fallback::{
    FallbackReason, FallbackStateMachine, ModePolicy, OperatingMode, RecoveryOutcome,
    SessionResources, SessionStatus, TriggerOutcome,
};
use crate::guard::{EndReason, SessionResourceGuard};
use crate::media::{EncoderProfile, LocalTrack, MediaDevice, MediaTrackProvider, TrackKind};
use crate::quality::{QualityClassifier, QualityLevel};
use crate::transport::{
    spawn_renewal_task, ConnectionState, CredentialToken, RenewalCommand, TokenFetcher, Transport,
    TransportEvent, TransportSession,
};

use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Bound on the actor mailbox.
const ENGINE_MAILBOX_CAPACITY: usize = 32;

/// Bound on the renewal command/result channels.
const RENEWAL_CHANNEL_CAPACITY: usize = 4;

/// Messages into the engine actor.
enum EngineMessage {
    TriggerFallback {
        reason: FallbackReason,
        respond_to: oneshot::Sender<TriggerOutcome>,
    },
    ForceMode {
        mode: OperatingMode,
        respond_to: oneshot::Sender<TriggerOutcome>,
    },
    AttemptRecovery {
        respond_to: oneshot::Sender<RecoveryOutcome>,
    },
    Status {
        respond_to: oneshot::Sender<SessionStatus>,
    },
    End {
        reason: EndReason,
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session engine.
#[derive(Clone)]
pub struct SessionEngineHandle {
    tx: mpsc::Sender<EngineMessage>,
    bus: FallbackEventBus,
}

impl SessionEngineHandle {
    /// The event bus for this session.
    #[must_use]
    pub fn events(&self) -> &FallbackEventBus {
        &self.bus
    }

    /// Report a degrade trigger to the engine.
    pub async fn trigger_fallback(
        &self,
        reason: FallbackReason,
    ) -> Result<TriggerOutcome, EngineError> {
        self.request(|respond_to| EngineMessage::TriggerFallback { reason, respond_to })
            .await
    }

    /// Force the session into a specific mode, in either direction.
    pub async fn force_mode(&self, mode: OperatingMode) -> Result<TriggerOutcome, EngineError> {
        self.request(|respond_to| EngineMessage::ForceMode { mode, respond_to })
            .await
    }

    /// Attempt recovery now instead of waiting for the next scheduled
    /// attempt.
    pub async fn attempt_recovery(&self) -> Result<RecoveryOutcome, EngineError> {
        self.request(|respond_to| EngineMessage::AttemptRecovery { respond_to })
            .await
    }

    /// Snapshot of the session state for the presentation layer.
    pub async fn status(&self) -> Result<SessionStatus, EngineError> {
        self.request(|respond_to| EngineMessage::Status { respond_to })
            .await
    }

    /// End the session and release every resource.
    ///
    /// Returns `Ok(true)` when teardown ran as a result of this call and
    /// `Ok(false)` when the engine had already stopped; ending twice is
    /// safe.
    pub async fn end(&self, reason: EndReason) -> Result<bool, EngineError> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(EngineMessage::End {
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Ok(false);
        }
        Ok(rx.await.is_ok())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineMessage,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Internal("engine stopped".to_string()))?;
        rx.await
            .map_err(|_| EngineError::Internal("engine dropped the request".to_string()))
    }
}

impl std::fmt::Debug for SessionEngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngineHandle").finish_non_exhaustive()
    }
}

/// The engine actor. Created and started through [`SessionEngine::spawn`].
pub struct SessionEngine {
    session_id: String,
    config: EngineConfig,
    machine: FallbackStateMachine,
    classifier: QualityClassifier,
    last_level: QualityLevel,
    res: SessionResources,
    guard: SessionResourceGuard,
    bus: FallbackEventBus,
    cancel: CancellationToken,
    startup_triggers: Vec<FallbackReason>,

    mailbox: mpsc::Receiver<EngineMessage>,
    transport_events: mpsc::Receiver<TransportEvent>,
    chat_events: mpsc::Receiver<ChatEvent>,
    force_renew: mpsc::Sender<RenewalCommand>,
    renewed_rx: mpsc::Receiver<CredentialToken>,
}

impl SessionEngine {
    /// Start a session: fetch the initial credential, join the channel,
    /// acquire and publish captures, take the wake lock, start token
    /// renewal, and spawn the actor.
    ///
    /// A capture device that fails at startup does not abort the session;
    /// the engine starts and immediately degrades to a mode the remaining
    /// devices support. Credential or join failures are hard errors.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn MediaDevice>,
        chat: Arc<dyn ChatChannel>,
        fetcher: Arc<dyn TokenFetcher>,
        transport_events: mpsc::Receiver<TransportEvent>,
        chat_events: mpsc::Receiver<ChatEvent>,
        bus: FallbackEventBus,
    ) -> Result<(SessionEngineHandle, JoinHandle<()>), EngineError> {
        let session_id = Uuid::new_v4().to_string();
        let token = fetcher.fetch().await?;

        let mut session = TransportSession::new(
            transport,
            config.channel.clone(),
            config.identity.clone(),
        );
        session.join(&token).await?;

        let mut provider = MediaTrackProvider::new(device);
        let mut startup_triggers = Vec::new();
        let mut tracks: Vec<LocalTrack> = Vec::new();
        match provider.acquire(TrackKind::Audio, None).await {
            Ok(track) => tracks.push(track),
            Err(e) => {
                warn!(target: "engine.media", error = %e, "Microphone unavailable at startup");
                startup_triggers.push(FallbackReason::MicrophoneError);
            }
        }
        match provider
            .acquire(TrackKind::Video, Some(EncoderProfile::full()))
            .await
        {
            Ok(track) => tracks.push(track),
            Err(e) => {
                warn!(target: "engine.media", error = %e, "Camera unavailable at startup");
                startup_triggers.push(FallbackReason::CameraError);
            }
        }
        if let Err(e) = session.publish(&tracks).await {
            // Nothing else owns the captures or the membership yet; free
            // them here or they outlive the failed startup.
            error!(
                target: "engine.transport",
                error = %e,
                "Initial publish failed, releasing startup resources"
            );
            provider.release_all().await;
            if let Err(leave_err) = session.leave().await {
                warn!(
                    target: "engine.transport",
                    error = %leave_err,
                    "Leave failed while unwinding a failed startup"
                );
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let mut guard = SessionResourceGuard::new(cancel.clone());
        match provider.acquire_wake_lock().await {
            Ok(handle) => guard.set_wake_lock(handle),
            Err(e) => {
                // The session runs without it; the screen may just dim.
                debug!(target: "engine.media", error = %e, "Wake lock unavailable");
            }
        }

        let (force_tx, force_rx) = mpsc::channel(RENEWAL_CHANNEL_CAPACITY);
        let (renewed_tx, renewed_rx) = mpsc::channel(RENEWAL_CHANNEL_CAPACITY);
        // Detached; it stops itself when `cancel` fires.
        let _renewal_task = spawn_renewal_task(
            token.clone(),
            fetcher,
            config.token_refresh_lead,
            config.token_retry_interval,
            force_rx,
            renewed_tx,
            cancel.clone(),
        );

        let policy = ModePolicy {
            enable_reduced_video: config.enable_reduced_video,
            enable_audio_only: config.enable_audio_only,
            enable_chat_fallback: config.enable_chat_fallback,
        };
        let machine = FallbackStateMachine::new(
            policy,
            config.fallback_timeout,
            config.history_limit,
            bus.clone(),
        );

        bus.publish(FallbackEvent::new(
            EventKind::ManagerInitialized,
            json!({
                "session_id": &session_id,
                "channel": &config.channel,
                "identity": &config.identity,
                "mode": OperatingMode::FullVideo,
                "available_modes": policy.available_modes(),
            }),
        ));
        info!(
            target: "engine.fallback",
            session_id = %session_id,
            channel = %config.channel,
            identity = %config.identity,
            "Session engine started"
        );

        let (mailbox_tx, mailbox) = mpsc::channel(ENGINE_MAILBOX_CAPACITY);
        let classifier = QualityClassifier::new(config.quality_window);
        let engine = SessionEngine {
            session_id,
            config,
            machine,
            classifier,
            last_level: QualityLevel::Good,
            res: SessionResources {
                transport: session,
                provider,
                chat,
                token,
            },
            guard,
            bus: bus.clone(),
            cancel,
            startup_triggers,
            mailbox,
            transport_events,
            chat_events,
            force_renew: force_tx,
            renewed_rx,
        };

        let join = tokio::spawn(engine.run());
        let handle = SessionEngineHandle {
            tx: mailbox_tx,
            bus,
        };
        Ok((handle, join))
    }

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    async fn run(mut self) {
        // Devices that failed during startup push the session down before
        // anything else happens.
        let startup_triggers = std::mem::take(&mut self.startup_triggers);
        for reason in startup_triggers {
            let _ = self
                .machine
                .trigger_fallback(reason, self.last_level, &mut self.res)
                .await;
        }

        // `interval` would yield its first tick immediately; the first
        // automatic recovery attempt must honor the configured delay.
        let mut recovery_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.recovery_delay,
            self.config.recovery_delay,
        );
        recovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.machine.is_terminal() {
                error!(
                    target: "engine.fallback",
                    "Fallback hierarchy exhausted, ending session"
                );
                self.guard.teardown(EndReason::Fatal, &mut self.res).await;
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(target: "engine.fallback", "Engine cancelled");
                    break;
                }
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => {
                            if !self.handle_message(msg).await {
                                break;
                            }
                        }
                        None => {
                            // Every handle dropped without an explicit end.
                            self.guard
                                .teardown(EndReason::NavigatedAway, &mut self.res)
                                .await;
                            break;
                        }
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                Some(event) = self.chat_events.recv() => {
                    if !self.handle_chat_event(event).await {
                        break;
                    }
                }
                Some(token) = self.renewed_rx.recv() => {
                    self.res.token = token.clone();
                    if let Err(e) = self.res.transport.renew_token(&token).await {
                        warn!(
                            target: "engine.token",
                            error = %e,
                            "Failed to apply renewed credential to transport"
                        );
                    }
                }
                _ = recovery_tick.tick() => {
                    if self.machine.is_fallback_active() && !self.guard.is_ended() {
                        let _ = self
                            .machine
                            .attempt_recovery(self.last_level, &mut self.res)
                            .await;
                    }
                }
            }
        }
        debug!(target: "engine.fallback", "Engine stopped");
    }

    /// Returns `false` when the actor should stop.
    async fn handle_message(&mut self, msg: EngineMessage) -> bool {
        match msg {
            EngineMessage::TriggerFallback { reason, respond_to } => {
                let outcome = self
                    .machine
                    .trigger_fallback(reason, self.last_level, &mut self.res)
                    .await;
                let _ = respond_to.send(outcome);
            }
            EngineMessage::ForceMode { mode, respond_to } => {
                let outcome = self.machine.force_mode(mode, &mut self.res).await;
                let _ = respond_to.send(outcome);
            }
            EngineMessage::AttemptRecovery { respond_to } => {
                let outcome = self
                    .machine
                    .attempt_recovery(self.last_level, &mut self.res)
                    .await;
                let _ = respond_to.send(outcome);
            }
            EngineMessage::Status { respond_to } => {
                let status = self.machine.status(self.res.chat.is_connected());
                let _ = respond_to.send(status);
            }
            EngineMessage::End { reason, respond_to } => {
                self.guard.teardown(reason, &mut self.res).await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Quality(sample) => {
                let level = self.classifier.classify(sample);
                self.last_level = level;
                let degrade = level >= self.config.degrade_threshold
                    || !self.machine.current().admits(level);
                if degrade && self.machine.phase().is_idle() {
                    let reason = if level == QualityLevel::Unusable {
                        FallbackReason::SevereNetworkIssue
                    } else {
                        FallbackReason::HighPacketLoss
                    };
                    let _ = self
                        .machine
                        .trigger_fallback(reason, level, &mut self.res)
                        .await;
                }
            }
            TransportEvent::ConnectionState {
                current,
                previous,
                reason,
            } => {
                info!(
                    target: "engine.transport",
                    from = %previous,
                    to = %current,
                    reason = %reason,
                    "Transport connection state changed"
                );
                match current {
                    ConnectionState::Failed => {
                        // The transport gave up on its own reconnection.
                        let _ = self
                            .machine
                            .trigger_fallback(
                                FallbackReason::RtcConnectionFailed,
                                QualityLevel::Unusable,
                                &mut self.res,
                            )
                            .await;
                    }
                    ConnectionState::Connected
                        if previous == ConnectionState::Reconnecting =>
                    {
                        // Stale samples from the bad stretch must not gate
                        // recovery on the fresh connection.
                        self.classifier.reset();
                    }
                    _ => {}
                }
            }
            TransportEvent::TokenWillExpire => {
                if self.force_renew.try_send(RenewalCommand::RenewNow).is_err() {
                    debug!(
                        target: "engine.token",
                        "Renewal already in flight, expiry warning ignored"
                    );
                }
            }
        }
    }

    /// Returns `false` when the actor should stop.
    async fn handle_chat_event(&mut self, event: ChatEvent) -> bool {
        match event {
            ChatEvent::Connected => {
                debug!(target: "engine.fallback", "Chat channel connected");
                true
            }
            ChatEvent::Disconnected { reason } => {
                if self.machine.current() == OperatingMode::ChatOnly {
                    // Nothing left to fall back to.
                    error!(
                        target: "engine.fallback",
                        reason = %reason,
                        "Chat lost while at the fallback floor"
                    );
                    self.bus.publish(FallbackEvent::new(
                        EventKind::ChatFailure,
                        json!({ "reason": reason, "fatal": true }),
                    ));
                    self.guard.teardown(EndReason::Fatal, &mut self.res).await;
                    return false;
                }
                debug!(
                    target: "engine.fallback",
                    reason = %reason,
                    "Chat disconnected outside chat-only, ignoring"
                );
                true
            }
        }
    }
}
