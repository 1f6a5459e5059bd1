//! Session engine error types.
//!
//! The taxonomy separates device-class failures from transport failures
//! because their recovery policies differ: device errors bar recovery into
//! modes that need the failed capture kind, transport errors escalate the
//! operating mode, and token renewal errors are retried without touching
//! the mode at all.

use crate::media::TrackKind;
use thiserror::Error;

/// Class of a device-layer failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The user or OS denied access to the capture device.
    #[error("permission denied")]
    PermissionDenied,

    /// The device exists but is held by another application.
    #[error("device busy")]
    DeviceBusy,

    /// No device of the requested kind is present.
    #[error("no device found")]
    NotFound,
}

/// A camera/microphone/screen acquisition failure.
#[derive(Debug, Error, Clone)]
#[error("{kind} acquiring {track_kind} track")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub track_kind: TrackKind,
}

impl DeviceError {
    #[must_use]
    pub fn new(kind: DeviceErrorKind, track_kind: TrackKind) -> Self {
        Self { kind, track_kind }
    }
}

/// Session engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Camera/microphone/screen capture unavailable.
    #[error("device acquisition failed: {0}")]
    DeviceAcquisition(#[from] DeviceError),

    /// Transport join/publish/unpublish/leave failure.
    #[error("transport error: {0}")]
    TransportConnection(String),

    /// Credential refresh against the token service failed.
    #[error("token renewal failed: {0}")]
    TokenRenewal(String),

    /// The text-fallback channel is down.
    #[error("chat connectivity error: {0}")]
    ChatConnectivity(String),

    /// A mode-switch procedure itself failed.
    #[error("transition failed: {0}")]
    Transition(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (channel plumbing, actor mailbox).
    #[error("internal error: {0}")]
    Internal(String),
}
