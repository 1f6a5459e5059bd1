//! The adaptive fallback state machine.
//!
//! Owns the ordered mode hierarchy and drives every degrade/recover
//! transition. All publish/unpublish requests funnel through here — no
//! other component may change what is live on the wire, which is what
//! keeps a UI-initiated change from racing an automatic fallback.
//!
//! # Mutual exclusion
//!
//! [`TransitionPhase`] is the system's only mutual-exclusion primitive:
//! exactly one transition is in flight at a time. Degrade triggers that
//! arrive mid-transition are not executed interleaved; the most severe
//! one is remembered and re-evaluated once the in-flight transition
//! commits. Recovery triggers arriving mid-transition are dropped.
//!
//! # Escalation
//!
//! A failed degrade automatically escalates to the next deeper enabled
//! mode instead of leaving the session stuck mid-failure. Failure at the
//! deepest enabled mode is terminal. Recovery failures never degrade;
//! they leave the session in its current (already degraded) mode.

use crate::chat::ChatChannel;
use crate::errors::EngineError;
use crate::events::{EventKind, FallbackEvent, FallbackEventBus};
use crate::fallback::modes::{OperatingMode, FALLBACK_CHAIN};
use crate::fallback::reasons::{resolve_target, FallbackReason, ModePolicy};
use crate::media::{EncoderProfile, MediaTrackProvider, TrackKind};
use crate::quality::QualityLevel;
use crate::transport::{CredentialToken, TransportSession};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Explicit transition state. Replaces a boolean flag plus a separately
/// tracked target mode, so "recovering with no target" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Idle,
    Degrading { target: OperatingMode },
    Recovering { target: OperatingMode },
}

impl TransitionPhase {
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, TransitionPhase::Idle)
    }

    #[must_use]
    pub fn target(self) -> Option<OperatingMode> {
        match self {
            TransitionPhase::Idle => None,
            TransitionPhase::Degrading { target } | TransitionPhase::Recovering { target } => {
                Some(target)
            }
        }
    }
}

/// One committed transition, kept in the bounded session history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub reason: Option<FallbackReason>,
    pub from: OperatingMode,
    pub to: OperatingMode,
    pub timestamp: DateTime<Utc>,
    pub quality: Option<QualityLevel>,
}

/// Status snapshot exposed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub current_mode: OperatingMode,
    pub current_mode_label: &'static str,
    pub is_fallback_active: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub transition_in_progress: bool,
    pub target_mode: Option<OperatingMode>,
    pub available_modes: Vec<OperatingMode>,
    pub chat_connected: bool,
    pub mode_attempt_counts: BTreeMap<OperatingMode, u32>,
    pub recent_history: Vec<TransitionRecord>,
}

/// Outcome of a degrade trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Transition committed to the given mode.
    Completed(OperatingMode),
    /// Target already matches the current mode; no work performed.
    NoOp,
    /// A transition was already in flight; the trigger was remembered
    /// (degrade) or dropped (recovery/force).
    RejectedBusy,
    /// The mode hierarchy is exhausted; the session is unrecoverable.
    Fatal,
}

/// Outcome of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered(OperatingMode),
    /// No better mode is currently eligible.
    NoCandidate,
    /// A transition was already in flight.
    Busy,
    /// The recovery procedure failed; the session stays in its mode.
    Failed,
}

/// Everything a transition procedure touches: the transport wrapper, the
/// track provider, the chat channel, and the current credential (needed
/// to re-join when recovering out of chat-only).
pub struct SessionResources {
    pub transport: TransportSession,
    pub provider: MediaTrackProvider,
    pub chat: Arc<dyn ChatChannel>,
    pub token: CredentialToken,
}

/// The fallback state machine.
pub struct FallbackStateMachine {
    policy: ModePolicy,
    fallback_timeout: Duration,
    history_limit: usize,
    bus: FallbackEventBus,

    current: OperatingMode,
    phase: TransitionPhase,
    fallback_reason: Option<FallbackReason>,
    /// Most severe degrade trigger rejected while a transition was in
    /// flight; re-evaluated when the machine returns to idle.
    pending: Option<(FallbackReason, QualityLevel)>,
    terminal: bool,
    history: VecDeque<TransitionRecord>,
    attempt_counts: BTreeMap<OperatingMode, u32>,
}

impl FallbackStateMachine {
    #[must_use]
    pub fn new(
        policy: ModePolicy,
        fallback_timeout: Duration,
        history_limit: usize,
        bus: FallbackEventBus,
    ) -> Self {
        Self {
            policy,
            fallback_timeout,
            history_limit,
            bus,
            current: OperatingMode::FullVideo,
            phase: TransitionPhase::Idle,
            fallback_reason: None,
            pending: None,
            terminal: false,
            history: VecDeque::new(),
            attempt_counts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn current(&self) -> OperatingMode {
        self.current
    }

    #[must_use]
    pub fn phase(&self) -> TransitionPhase {
        self.phase
    }

    /// Set once the hierarchy has been exhausted; the session must be
    /// torn down.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// A fallback is active until the session recovers all the way back
    /// to full video.
    #[must_use]
    pub fn is_fallback_active(&self) -> bool {
        self.current != OperatingMode::FullVideo
    }

    /// Status snapshot for the presentation layer.
    #[must_use]
    pub fn status(&self, chat_connected: bool) -> SessionStatus {
        SessionStatus {
            current_mode: self.current,
            current_mode_label: self.current.label(),
            is_fallback_active: self.is_fallback_active(),
            fallback_reason: self.fallback_reason,
            transition_in_progress: !self.phase.is_idle(),
            target_mode: self.phase.target(),
            available_modes: self.policy.available_modes(),
            chat_connected,
            mode_attempt_counts: self.attempt_counts.clone(),
            recent_history: self.history.iter().cloned().collect(),
        }
    }

    /// Trigger a degrade.
    ///
    /// Rejected (and remembered, most-severe-wins) while another
    /// transition is in flight. A no-op when the resolved target already
    /// matches the current mode.
    pub async fn trigger_fallback(
        &mut self,
        reason: FallbackReason,
        level: QualityLevel,
        res: &mut SessionResources,
    ) -> TriggerOutcome {
        if !self.phase.is_idle() {
            self.remember_pending(reason, level);
            debug!(
                target: "engine.fallback",
                reason = %reason,
                "Degrade trigger rejected, transition in flight"
            );
            return TriggerOutcome::RejectedBusy;
        }

        let target = resolve_target(reason, self.current, level, &self.policy);
        let outcome = self.degrade_to(target, reason, Some(level), res).await;
        self.drain_pending(res).await;
        outcome
    }

    /// Force the session into a specific mode, in either direction.
    ///
    /// Degrading honors the normal escalation path; forcing a richer mode
    /// follows the recovery procedure but bypasses the quality gate
    /// (device preconditions still hold).
    pub async fn force_mode(
        &mut self,
        mode: OperatingMode,
        res: &mut SessionResources,
    ) -> TriggerOutcome {
        if !self.phase.is_idle() {
            return TriggerOutcome::RejectedBusy;
        }
        if mode == self.current {
            return TriggerOutcome::NoOp;
        }
        if mode > self.current {
            let outcome = self
                .degrade_to(mode, FallbackReason::Manual, None, res)
                .await;
            self.drain_pending(res).await;
            return outcome;
        }
        match self.recover_to(mode, None, res).await {
            RecoveryOutcome::Recovered(mode) => TriggerOutcome::Completed(mode),
            RecoveryOutcome::NoCandidate | RecoveryOutcome::Busy | RecoveryOutcome::Failed => {
                TriggerOutcome::NoOp
            }
        }
    }

    /// Attempt to step back up. Callers are expected to throttle this
    /// (the engine runs it on a fixed interval, never per-sample).
    pub async fn attempt_recovery(
        &mut self,
        level: QualityLevel,
        res: &mut SessionResources,
    ) -> RecoveryOutcome {
        if !self.phase.is_idle() {
            return RecoveryOutcome::Busy;
        }
        if !self.is_fallback_active() {
            return RecoveryOutcome::NoCandidate;
        }

        let candidate = FALLBACK_CHAIN.iter().copied().find(|m| {
            *m < self.current
                && self.policy.is_enabled(*m)
                && m.admits(level)
                && self.preconditions_hold(*m, res)
        });
        let Some(target) = candidate else {
            debug!(
                target: "engine.fallback",
                quality = %level,
                current = %self.current,
                "No eligible recovery candidate"
            );
            return RecoveryOutcome::NoCandidate;
        };

        let outcome = self.recover_to(target, Some(level), res).await;
        self.drain_pending(res).await;
        outcome
    }

    // ------------------------------------------------------------------
    // Degrade path
    // ------------------------------------------------------------------

    async fn degrade_to(
        &mut self,
        first_target: OperatingMode,
        reason: FallbackReason,
        level: Option<QualityLevel>,
        res: &mut SessionResources,
    ) -> TriggerOutcome {
        if first_target == self.current {
            return TriggerOutcome::NoOp;
        }

        let from = self.current;
        let mut target = first_target;
        loop {
            self.phase = TransitionPhase::Degrading { target };
            *self.attempt_counts.entry(target).or_insert(0) += 1;
            info!(
                target: "engine.fallback",
                reason = %reason,
                from = %from,
                to = %target,
                "Fallback started"
            );
            self.publish(
                EventKind::FallbackStarted,
                json!({ "reason": reason, "from": from, "to": target, "quality": level }),
            );

            let timeout = self.fallback_timeout;
            let result =
                match tokio::time::timeout(timeout, Self::execute_degrade(target, res)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Transition(format!(
                        "transition to {target} timed out"
                    ))),
                };

            match result {
                Ok(()) => {
                    self.current = target;
                    self.phase = TransitionPhase::Idle;
                    self.fallback_reason = Some(reason);
                    self.push_history(Some(reason), from, target, level);
                    info!(
                        target: "engine.fallback",
                        from = %from,
                        to = %target,
                        "Fallback completed"
                    );
                    self.publish(
                        EventKind::FallbackCompleted,
                        json!({ "reason": reason, "from": from, "to": target }),
                    );
                    self.publish_tracks_updated(res);
                    return TriggerOutcome::Completed(target);
                }
                Err(e) => {
                    let next = self.policy.next_enabled_below(target);
                    let fatal = next.is_none();
                    warn!(
                        target: "engine.fallback",
                        to = %target,
                        error = %e,
                        fatal,
                        "Fallback transition failed"
                    );
                    self.publish(
                        EventKind::FallbackFailed,
                        json!({
                            "reason": reason,
                            "target": target,
                            "error": e.to_string(),
                            "fatal": fatal,
                        }),
                    );
                    match next {
                        // Escalate to the next deeper mode instead of
                        // leaving the session stuck mid-failure.
                        Some(next) => target = next,
                        None => {
                            error!(
                                target: "engine.fallback",
                                "Mode hierarchy exhausted, session is unrecoverable"
                            );
                            self.phase = TransitionPhase::Idle;
                            self.terminal = true;
                            return TriggerOutcome::Fatal;
                        }
                    }
                }
            }
        }
    }

    /// Mode-specific degrade procedure. Steps run strictly in sequence
    /// (unpublish before stop) so the transport never observes an
    /// inconsistent published set.
    async fn execute_degrade(
        target: OperatingMode,
        res: &mut SessionResources,
    ) -> Result<(), EngineError> {
        if target == OperatingMode::ChatOnly {
            // The transport may already be dead when we land here; its
            // teardown is best-effort. Only the chat channel is a hard
            // requirement for the floor.
            if let Err(e) = res
                .transport
                .unpublish(&[TrackKind::Audio, TrackKind::Video, TrackKind::Screen])
                .await
            {
                warn!(target: "engine.fallback", error = %e, "Unpublish during chat fallback failed");
            }
            res.provider.release_all().await;
            if let Err(e) = res.transport.leave().await {
                warn!(target: "engine.fallback", error = %e, "Leave during chat fallback failed");
            }
            res.chat.connect().await?;
            return Ok(());
        }

        let req = target.requirements();
        if !req.needs_video {
            res.transport
                .unpublish(&[TrackKind::Video, TrackKind::Screen])
                .await?;
            res.provider.release(TrackKind::Video).await;
            res.provider.release(TrackKind::Screen).await;
        } else if target == OperatingMode::ReducedVideo {
            // Video stays published; only the encoder constraints drop.
            res.provider
                .reconfigure_video(EncoderProfile::reduced())
                .await?;
        }
        if !req.needs_audio {
            res.transport.unpublish(&[TrackKind::Audio]).await?;
            res.provider.release(TrackKind::Audio).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery path
    // ------------------------------------------------------------------

    async fn recover_to(
        &mut self,
        target: OperatingMode,
        level: Option<QualityLevel>,
        res: &mut SessionResources,
    ) -> RecoveryOutcome {
        let from = self.current;
        self.phase = TransitionPhase::Recovering { target };
        info!(
            target: "engine.fallback",
            from = %from,
            to = %target,
            "Recovery started"
        );
        self.publish(
            EventKind::RecoveryStarted,
            json!({ "from": from, "to": target, "quality": level }),
        );

        let timeout = self.fallback_timeout;
        let was_chat_only = from == OperatingMode::ChatOnly;
        let result = match tokio::time::timeout(
            timeout,
            Self::execute_recover(target, was_chat_only, res),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Transition(format!(
                "recovery to {target} timed out"
            ))),
        };

        match result {
            Ok(()) => {
                self.current = target;
                self.phase = TransitionPhase::Idle;
                if target == OperatingMode::FullVideo {
                    self.fallback_reason = None;
                }
                self.push_history(None, from, target, level);
                info!(
                    target: "engine.fallback",
                    from = %from,
                    to = %target,
                    "Recovery completed"
                );
                self.publish(
                    EventKind::RecoveryCompleted,
                    json!({ "from": from, "to": target }),
                );
                self.publish_tracks_updated(res);
                RecoveryOutcome::Recovered(target)
            }
            Err(e) => {
                // Recovery failures never degrade further; the session
                // stays where it is.
                warn!(
                    target: "engine.fallback",
                    to = %target,
                    error = %e,
                    "Recovery failed, staying in current mode"
                );
                self.phase = TransitionPhase::Idle;
                self.publish(
                    EventKind::RecoveryFailed,
                    json!({ "target": target, "error": e.to_string() }),
                );
                self.rollback_recovery(res).await;
                RecoveryOutcome::Failed
            }
        }
    }

    /// Mode-specific recovery procedure: re-join, reacquire, re-publish.
    async fn execute_recover(
        target: OperatingMode,
        was_chat_only: bool,
        res: &mut SessionResources,
    ) -> Result<(), EngineError> {
        let req = target.requirements();

        if req.needs_transport && !res.transport.is_joined() {
            let token = res.token.clone();
            res.transport.join(&token).await?;
        }

        if req.needs_audio && !res.transport.is_published(TrackKind::Audio) {
            let track = res.provider.acquire(TrackKind::Audio, None).await?;
            res.transport.publish(&[track]).await?;
        }

        if req.needs_video {
            let profile = if target == OperatingMode::FullVideo {
                EncoderProfile::full()
            } else {
                EncoderProfile::reduced()
            };
            if res.transport.is_published(TrackKind::Video) {
                res.provider.reconfigure_video(profile).await?;
            } else {
                let track = res.provider.acquire(TrackKind::Video, Some(profile)).await?;
                res.transport.publish(&[track]).await?;
            }
        }

        if was_chat_only {
            res.chat.disconnect().await;
        }
        Ok(())
    }

    /// Undo partial acquisitions after a failed recovery so the resource
    /// set keeps matching the (unchanged) current mode.
    async fn rollback_recovery(&mut self, res: &mut SessionResources) {
        let req = self.current.requirements();
        let keep = |kind: TrackKind| match kind {
            TrackKind::Audio => req.needs_audio,
            TrackKind::Video | TrackKind::Screen => req.needs_video,
        };
        for kind in [TrackKind::Audio, TrackKind::Video, TrackKind::Screen] {
            if !keep(kind) {
                if res.transport.is_published(kind) {
                    if let Err(e) = res.transport.unpublish(&[kind]).await {
                        warn!(target: "engine.fallback", error = %e, kind = %kind, "Rollback unpublish failed");
                    }
                }
                res.provider.release(kind).await;
            }
        }
        if !req.needs_transport && res.transport.is_joined() {
            if let Err(e) = res.transport.leave().await {
                warn!(target: "engine.fallback", error = %e, "Rollback leave failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending triggers / helpers
    // ------------------------------------------------------------------

    fn preconditions_hold(&self, mode: OperatingMode, res: &SessionResources) -> bool {
        let req = mode.requirements();
        (!req.needs_video || res.provider.can_acquire(TrackKind::Video))
            && (!req.needs_audio || res.provider.can_acquire(TrackKind::Audio))
    }

    fn remember_pending(&mut self, reason: FallbackReason, level: QualityLevel) {
        match self.pending {
            Some((existing, _)) if existing.severity() >= reason.severity() => {}
            _ => self.pending = Some((reason, level)),
        }
    }

    async fn drain_pending(&mut self, res: &mut SessionResources) {
        while let Some((reason, level)) = self.pending.take() {
            if !self.phase.is_idle() || self.terminal {
                break;
            }
            let target = resolve_target(reason, self.current, level, &self.policy);
            if target == self.current {
                continue;
            }
            debug!(
                target: "engine.fallback",
                reason = %reason,
                "Re-evaluating degrade trigger deferred during transition"
            );
            let _ = self.degrade_to(target, reason, Some(level), res).await;
        }
    }

    fn push_history(
        &mut self,
        reason: Option<FallbackReason>,
        from: OperatingMode,
        to: OperatingMode,
        quality: Option<QualityLevel>,
    ) {
        self.history.push_back(TransitionRecord {
            reason,
            from,
            to,
            timestamp: Utc::now(),
            quality,
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        self.bus.publish(FallbackEvent::new(kind, payload));
    }

    fn publish_tracks_updated(&self, res: &SessionResources) {
        self.publish(
            EventKind::TracksUpdated,
            json!({
                "published": res.transport.published_kinds(),
                "live": res.provider.live_kinds(),
            }),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::{DeviceError, DeviceErrorKind};
    use crate::media::{LocalTrack, MediaDevice, WakeLockHandle};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        fail_join: AtomicBool,
        fail_leave: AtomicBool,
        fail_publish: AtomicBool,
        fail_unpublish: AtomicBool,
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn join(
            &self,
            _channel: &str,
            _token: &CredentialToken,
            _identity: &str,
        ) -> Result<(), EngineError> {
            if self.fail_join.load(Ordering::SeqCst) {
                return Err(EngineError::TransportConnection("join refused".to_string()));
            }
            self.joins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn leave(&self) -> Result<(), EngineError> {
            if self.fail_leave.load(Ordering::SeqCst) {
                return Err(EngineError::TransportConnection("leave refused".to_string()));
            }
            self.leaves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, _tracks: &[LocalTrack]) -> Result<(), EngineError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(EngineError::TransportConnection(
                    "publish refused".to_string(),
                ));
            }
            Ok(())
        }

        async fn unpublish(&self, _kinds: &[TrackKind]) -> Result<(), EngineError> {
            if self.fail_unpublish.load(Ordering::SeqCst) {
                return Err(EngineError::TransportConnection(
                    "unpublish refused".to_string(),
                ));
            }
            Ok(())
        }

        async fn renew_token(&self, _token: &CredentialToken) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDevice {
        fail_create: Mutex<HashMap<TrackKind, DeviceErrorKind>>,
        fail_reconfigure: AtomicBool,
        hang_reconfigure: AtomicBool,
        reconfigures: AtomicUsize,
    }

    #[async_trait]
    impl MediaDevice for MockDevice {
        async fn create_track(
            &self,
            kind: TrackKind,
            profile: Option<EncoderProfile>,
        ) -> Result<LocalTrack, DeviceError> {
            if let Some(err) = self.fail_create.lock().unwrap().get(&kind) {
                return Err(DeviceError::new(*err, kind));
            }
            Ok(LocalTrack::new(kind, profile))
        }

        async fn reconfigure_video(
            &self,
            _track: &LocalTrack,
            _profile: EncoderProfile,
        ) -> Result<(), DeviceError> {
            if self.hang_reconfigure.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_reconfigure.load(Ordering::SeqCst) {
                return Err(DeviceError::new(DeviceErrorKind::DeviceBusy, TrackKind::Video));
            }
            self.reconfigures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_track(&self, _track: &LocalTrack) {}

        async fn acquire_wake_lock(&self) -> Result<WakeLockHandle, DeviceError> {
            Ok(WakeLockHandle::new("lock-1".to_string()))
        }

        async fn release_wake_lock(&self, _handle: WakeLockHandle) {}
    }

    #[derive(Default)]
    struct MockChat {
        connected: AtomicBool,
        fail_connect: AtomicBool,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ChatChannel for MockChat {
        async fn connect(&self) -> Result<(), EngineError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(EngineError::ChatConnectivity(
                    "chat unreachable".to_string(),
                ));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn token() -> CredentialToken {
        CredentialToken::new("tok", Utc::now() + chrono::Duration::seconds(3600))
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        device: Arc<MockDevice>,
        chat: Arc<MockChat>,
        machine: FallbackStateMachine,
        bus: FallbackEventBus,
        res: SessionResources,
    }

    /// Fixture with a fully started session: joined, audio and video
    /// published at the full profile.
    async fn started() -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let device = Arc::new(MockDevice::default());
        let chat = Arc::new(MockChat::default());

        let mut session = TransportSession::new(
            transport.clone(),
            "call-1".to_string(),
            "viewer-1".to_string(),
        );
        session.join(&token()).await.unwrap();

        let mut provider = MediaTrackProvider::new(device.clone());
        let audio = provider.acquire(TrackKind::Audio, None).await.unwrap();
        let video = provider
            .acquire(TrackKind::Video, Some(EncoderProfile::full()))
            .await
            .unwrap();
        session.publish(&[audio, video]).await.unwrap();

        let bus = FallbackEventBus::new();
        let machine = FallbackStateMachine::new(
            ModePolicy::default(),
            Duration::from_secs(10),
            32,
            bus.clone(),
        );
        let res = SessionResources {
            transport: session,
            provider,
            chat: chat.clone(),
            token: token(),
        };
        Fixture {
            transport,
            device,
            chat,
            machine,
            bus,
            res,
        }
    }

    #[tokio::test]
    async fn test_quality_degrade_reduces_video_in_place() {
        let mut f = started().await;

        let outcome = f
            .machine
            .trigger_fallback(FallbackReason::HighPacketLoss, QualityLevel::Poor, &mut f.res)
            .await;

        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::ReducedVideo));
        assert_eq!(f.machine.current(), OperatingMode::ReducedVideo);
        // Video stays on the wire; only the encoder changed.
        assert!(f.res.transport.is_published(TrackKind::Video));
        assert_eq!(f.device.reconfigures.load(Ordering::SeqCst), 1);
        assert!(f.machine.is_fallback_active());
    }

    #[tokio::test]
    async fn test_repeated_trigger_to_same_target_is_noop() {
        let mut f = started().await;

        let first = f
            .machine
            .trigger_fallback(FallbackReason::CameraError, QualityLevel::Good, &mut f.res)
            .await;
        assert_eq!(first, TriggerOutcome::Completed(OperatingMode::AudioOnly));

        let (_sub, mut rx) = f.bus.subscribe(EventKind::FallbackStarted);
        let second = f
            .machine
            .trigger_fallback(FallbackReason::CameraError, QualityLevel::Good, &mut f.res)
            .await;
        assert_eq!(second, TriggerOutcome::NoOp);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.machine.status(false).recent_history.len(), 1);
    }

    #[tokio::test]
    async fn test_camera_error_lands_in_audio_only() {
        let mut f = started().await;

        let outcome = f
            .machine
            .trigger_fallback(FallbackReason::CameraError, QualityLevel::Good, &mut f.res)
            .await;

        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::AudioOnly));
        assert!(!f.res.transport.is_published(TrackKind::Video));
        assert!(f.res.transport.is_published(TrackKind::Audio));
        assert!(f.res.provider.current(TrackKind::Video).is_none());
        assert!(f.res.provider.current(TrackKind::Audio).is_some());
    }

    #[tokio::test]
    async fn test_connection_failure_reaches_chat_even_with_dead_transport() {
        let mut f = started().await;
        f.transport.fail_unpublish.store(true, Ordering::SeqCst);
        f.transport.fail_leave.store(true, Ordering::SeqCst);

        let outcome = f
            .machine
            .trigger_fallback(
                FallbackReason::RtcConnectionFailed,
                QualityLevel::Unusable,
                &mut f.res,
            )
            .await;

        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::ChatOnly));
        assert!(f.chat.is_connected());
        assert!(f.res.provider.live_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transition_escalates_to_next_mode() {
        let mut f = started().await;
        f.device.fail_reconfigure.store(true, Ordering::SeqCst);
        let (_sub, mut rx) = f.bus.subscribe_all();

        let outcome = f
            .machine
            .trigger_fallback(FallbackReason::HighPacketLoss, QualityLevel::Poor, &mut f.res)
            .await;

        // ReducedVideo fails (encoder refused), escalation lands in AudioOnly.
        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::AudioOnly));
        assert!(!f.machine.is_terminal());

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::FallbackStarted,
                EventKind::FallbackFailed,
                EventKind::FallbackStarted,
                EventKind::FallbackCompleted,
                EventKind::TracksUpdated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_timeout_escalates() {
        let mut f = started().await;
        f.device.hang_reconfigure.store(true, Ordering::SeqCst);

        let outcome = f
            .machine
            .trigger_fallback(FallbackReason::PoorVideoQuality, QualityLevel::Poor, &mut f.res)
            .await;

        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::AudioOnly));
    }

    #[tokio::test]
    async fn test_exhausted_hierarchy_is_fatal() {
        let mut f = started().await;
        f.chat.fail_connect.store(true, Ordering::SeqCst);
        let (_sub, mut rx) = f.bus.subscribe(EventKind::FallbackFailed);

        let outcome = f
            .machine
            .trigger_fallback(
                FallbackReason::MicrophoneError,
                QualityLevel::Good,
                &mut f.res,
            )
            .await;

        assert_eq!(outcome, TriggerOutcome::Fatal);
        assert!(f.machine.is_terminal());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload["fatal"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn test_recovery_returns_to_full_video_and_clears_reason() {
        let mut f = started().await;
        f.machine
            .trigger_fallback(FallbackReason::HighPacketLoss, QualityLevel::Bad, &mut f.res)
            .await;
        assert_eq!(f.machine.current(), OperatingMode::ReducedVideo);

        let outcome = f
            .machine
            .attempt_recovery(QualityLevel::Excellent, &mut f.res)
            .await;

        assert_eq!(outcome, RecoveryOutcome::Recovered(OperatingMode::FullVideo));
        assert!(!f.machine.is_fallback_active());
        assert!(f.machine.status(false).fallback_reason.is_none());
    }

    #[tokio::test]
    async fn test_recovery_requires_quality_at_or_above_minimum() {
        let mut f = started().await;
        f.machine
            .trigger_fallback(FallbackReason::CameraError, QualityLevel::Good, &mut f.res)
            .await;
        assert_eq!(f.machine.current(), OperatingMode::AudioOnly);

        // Poor is below ReducedVideo's Fair minimum.
        let outcome = f.machine.attempt_recovery(QualityLevel::Poor, &mut f.res).await;
        assert_eq!(outcome, RecoveryOutcome::NoCandidate);

        // Exactly at the minimum is eligible.
        let outcome = f.machine.attempt_recovery(QualityLevel::Fair, &mut f.res).await;
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered(OperatingMode::ReducedVideo)
        );
    }

    #[tokio::test]
    async fn test_recovery_barred_by_recorded_device_failure() {
        let mut f = started().await;
        f.machine
            .trigger_fallback(FallbackReason::CameraError, QualityLevel::Good, &mut f.res)
            .await;

        // The camera is still broken: reacquire fails and records it.
        f.device
            .fail_create
            .lock()
            .unwrap()
            .insert(TrackKind::Video, DeviceErrorKind::NotFound);
        let _ = f.res.provider.acquire(TrackKind::Video, None).await;
        assert!(!f.res.provider.can_acquire(TrackKind::Video));

        let outcome = f
            .machine
            .attempt_recovery(QualityLevel::Excellent, &mut f.res)
            .await;
        assert_eq!(outcome, RecoveryOutcome::NoCandidate);
        assert_eq!(f.machine.current(), OperatingMode::AudioOnly);
    }

    #[tokio::test]
    async fn test_failed_recovery_rolls_back_to_current_mode() {
        let mut f = started().await;
        f.machine
            .trigger_fallback(
                FallbackReason::SevereNetworkIssue,
                QualityLevel::Unusable,
                &mut f.res,
            )
            .await;
        assert_eq!(f.machine.current(), OperatingMode::ChatOnly);

        f.transport.fail_publish.store(true, Ordering::SeqCst);
        let outcome = f
            .machine
            .attempt_recovery(QualityLevel::Excellent, &mut f.res)
            .await;

        assert_eq!(outcome, RecoveryOutcome::Failed);
        assert_eq!(f.machine.current(), OperatingMode::ChatOnly);
        // Partial acquisitions were undone and the re-join rolled back.
        assert!(f.res.provider.live_kinds().is_empty());
        assert!(!f.res.transport.is_joined());
    }

    #[tokio::test]
    async fn test_force_mode_round_trip() {
        let mut f = started().await;

        let down = f.machine.force_mode(OperatingMode::AudioOnly, &mut f.res).await;
        assert_eq!(down, TriggerOutcome::Completed(OperatingMode::AudioOnly));
        assert_eq!(
            f.machine.status(false).fallback_reason,
            Some(FallbackReason::Manual)
        );

        // Forcing up bypasses the quality gate entirely.
        let up = f.machine.force_mode(OperatingMode::FullVideo, &mut f.res).await;
        assert_eq!(up, TriggerOutcome::Completed(OperatingMode::FullVideo));
        assert!(f.res.transport.is_published(TrackKind::Video));

        let same = f.machine.force_mode(OperatingMode::FullVideo, &mut f.res).await;
        assert_eq!(same, TriggerOutcome::NoOp);
    }

    #[tokio::test]
    async fn test_deferred_trigger_keeps_most_severe_and_drains() {
        let mut f = started().await;

        // Simulate an in-flight transition.
        f.machine.phase = TransitionPhase::Degrading {
            target: OperatingMode::ReducedVideo,
        };

        let first = f
            .machine
            .trigger_fallback(FallbackReason::HighPacketLoss, QualityLevel::Poor, &mut f.res)
            .await;
        let second = f
            .machine
            .trigger_fallback(
                FallbackReason::RtcConnectionFailed,
                QualityLevel::Unusable,
                &mut f.res,
            )
            .await;
        assert_eq!(first, TriggerOutcome::RejectedBusy);
        assert_eq!(second, TriggerOutcome::RejectedBusy);
        // A milder trigger never displaces a more severe pending one.
        let third = f
            .machine
            .trigger_fallback(FallbackReason::PoorVideoQuality, QualityLevel::Bad, &mut f.res)
            .await;
        assert_eq!(third, TriggerOutcome::RejectedBusy);

        // Transition commits; the deferred severe trigger re-evaluates.
        f.machine.phase = TransitionPhase::Idle;
        f.machine.drain_pending(&mut f.res).await;
        assert_eq!(f.machine.current(), OperatingMode::ChatOnly);
    }

    #[tokio::test]
    async fn test_disabled_modes_are_skipped() {
        let mut f = started().await;
        f.machine.policy = ModePolicy {
            enable_reduced_video: false,
            enable_audio_only: true,
            enable_chat_fallback: true,
        };

        let outcome = f
            .machine
            .trigger_fallback(FallbackReason::HighPacketLoss, QualityLevel::Poor, &mut f.res)
            .await;
        assert_eq!(outcome, TriggerOutcome::Completed(OperatingMode::AudioOnly));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_attempts_counted() {
        let mut f = started().await;
        f.machine.history_limit = 2;

        for _ in 0..3 {
            f.machine.force_mode(OperatingMode::AudioOnly, &mut f.res).await;
            f.machine.force_mode(OperatingMode::FullVideo, &mut f.res).await;
        }

        let status = f.machine.status(false);
        assert_eq!(status.recent_history.len(), 2);
        assert_eq!(
            status.mode_attempt_counts.get(&OperatingMode::AudioOnly),
            Some(&3)
        );
    }

    #[tokio::test]
    async fn test_status_reflects_transition_phase() {
        let f = started().await;
        let status = f.machine.status(true);
        assert_eq!(status.current_mode, OperatingMode::FullVideo);
        assert_eq!(status.current_mode_label, "Full video");
        assert!(!status.transition_in_progress);
        assert!(status.target_mode.is_none());
        assert!(status.chat_connected);
        assert_eq!(status.available_modes.len(), 4);
    }
}
