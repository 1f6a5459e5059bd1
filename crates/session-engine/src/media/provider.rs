//! Local capture acquisition and release.
//!
//! [`MediaTrackProvider`] owns every local capture for the session. Acquire
//! is idempotent per kind, release is a no-op for absent tracks, and
//! device-class failures are remembered per kind so recovery into a mode
//! that needs the failed capture stays barred until a reacquire succeeds.

use crate::errors::{DeviceError, DeviceErrorKind};
use crate::media::tracks::{EncoderProfile, LocalTrack, MediaTrackSet, TrackKind};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to a held screen wake lock.
#[derive(Debug)]
pub struct WakeLockHandle {
    id: String,
}

impl WakeLockHandle {
    #[must_use]
    pub fn new(id: String) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Device-layer collaborator: camera/microphone capture and the screen
/// wake lock. Implemented outside the engine; injected at construction.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Open a capture of the given kind. `profile` applies to video kinds.
    async fn create_track(
        &self,
        kind: TrackKind,
        profile: Option<EncoderProfile>,
    ) -> Result<LocalTrack, DeviceError>;

    /// Re-apply encoder constraints to a live video track without
    /// recreating the capture.
    async fn reconfigure_video(
        &self,
        track: &LocalTrack,
        profile: EncoderProfile,
    ) -> Result<(), DeviceError>;

    /// Stop hardware capture for a track. Must be safe to call for a track
    /// the device has already torn down on its own.
    async fn stop_track(&self, track: &LocalTrack);

    /// Request the screen wake lock.
    async fn acquire_wake_lock(&self) -> Result<WakeLockHandle, DeviceError>;

    /// Release a previously acquired wake lock.
    async fn release_wake_lock(&self, handle: WakeLockHandle);
}

/// Owns local capture tracks for the lifetime of the session.
pub struct MediaTrackProvider {
    device: Arc<dyn MediaDevice>,
    tracks: MediaTrackSet,
    /// Last device-class failure per kind; cleared on successful acquire.
    last_failure: HashMap<TrackKind, DeviceErrorKind>,
}

impl MediaTrackProvider {
    #[must_use]
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        Self {
            device,
            tracks: MediaTrackSet::new(),
            last_failure: HashMap::new(),
        }
    }

    /// Acquire a capture of `kind`.
    ///
    /// Idempotent: if a live track of that kind already exists it is
    /// returned as-is instead of opening a duplicate capture.
    pub async fn acquire(
        &mut self,
        kind: TrackKind,
        profile: Option<EncoderProfile>,
    ) -> Result<LocalTrack, DeviceError> {
        if let Some(existing) = self.tracks.get(kind) {
            debug!(
                target: "engine.media",
                kind = %kind,
                track_id = %existing.id(),
                "Acquire is a no-op, track already live"
            );
            return Ok(existing.clone());
        }

        match self.device.create_track(kind, profile).await {
            Ok(track) => {
                info!(
                    target: "engine.media",
                    kind = %kind,
                    track_id = %track.id(),
                    "Track acquired"
                );
                self.last_failure.remove(&kind);
                self.tracks.insert(track.clone());
                Ok(track)
            }
            Err(err) => {
                warn!(
                    target: "engine.media",
                    kind = %kind,
                    error = %err,
                    "Track acquisition failed"
                );
                self.last_failure.insert(kind, err.kind);
                Err(err)
            }
        }
    }

    /// Stop and free the capture of `kind`. Releasing an absent or
    /// already-released kind is a no-op.
    pub async fn release(&mut self, kind: TrackKind) {
        if let Some(track) = self.tracks.take(kind) {
            self.device.stop_track(&track).await;
            info!(
                target: "engine.media",
                kind = %kind,
                track_id = %track.id(),
                "Track released"
            );
        }
    }

    /// Release every live track.
    pub async fn release_all(&mut self) {
        for kind in self.tracks.kinds() {
            self.release(kind).await;
        }
    }

    /// Re-apply encoder constraints to the live video track.
    pub async fn reconfigure_video(
        &mut self,
        profile: EncoderProfile,
    ) -> Result<(), DeviceError> {
        let Some(track) = self.tracks.get(TrackKind::Video) else {
            return Err(DeviceError::new(DeviceErrorKind::NotFound, TrackKind::Video));
        };
        self.device.reconfigure_video(track, profile).await?;
        if let Some(track) = self.tracks.get_mut(TrackKind::Video) {
            track.set_profile(profile);
        }
        debug!(
            target: "engine.media",
            width = profile.width,
            height = profile.height,
            frame_rate = profile.frame_rate,
            max_bitrate_kbps = profile.max_bitrate_kbps,
            "Video encoder reconfigured"
        );
        Ok(())
    }

    /// Whether recovery into a mode needing `kind` is currently allowed.
    ///
    /// True when the kind is already live or has no recorded device
    /// failure. A recorded failure is only cleared by a successful
    /// reacquire.
    #[must_use]
    pub fn can_acquire(&self, kind: TrackKind) -> bool {
        self.tracks.get(kind).is_some() || !self.last_failure.contains_key(&kind)
    }

    #[must_use]
    pub fn current(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.get(kind)
    }

    /// Kinds with a live capture.
    #[must_use]
    pub fn live_kinds(&self) -> Vec<TrackKind> {
        self.tracks.kinds()
    }

    /// Request the screen wake lock from the device layer.
    pub async fn acquire_wake_lock(&self) -> Result<WakeLockHandle, DeviceError> {
        self.device.acquire_wake_lock().await
    }

    /// Release a held wake lock.
    pub async fn release_wake_lock(&self, handle: WakeLockHandle) {
        self.device.release_wake_lock(handle).await;
    }
}
