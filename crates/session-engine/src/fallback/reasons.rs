//! Fallback trigger reasons and the reason→target lookup table.
//!
//! Target resolution is data-driven and independently testable: a single
//! function of `(reason, current mode, quality level)` plus the deployment
//! mode policy, instead of branching scattered through the state machine.

use crate::fallback::modes::{OperatingMode, FALLBACK_CHAIN};
use crate::quality::QualityLevel;
use serde::Serialize;
use std::fmt;

/// Why a degrade was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    PoorVideoQuality,
    HighPacketLoss,
    VideoTrackFailed,
    CameraError,
    AudioTrackFailed,
    MicrophoneError,
    RtcConnectionFailed,
    SevereNetworkIssue,
    LowBandwidth,
    Manual,
}

impl FallbackReason {
    /// Severity rank used when two triggers race for the same machine:
    /// most-severe-reason-wins. Higher = more severe.
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            FallbackReason::Manual => 0,
            FallbackReason::PoorVideoQuality
            | FallbackReason::HighPacketLoss
            | FallbackReason::LowBandwidth => 1,
            FallbackReason::VideoTrackFailed | FallbackReason::CameraError => 2,
            FallbackReason::AudioTrackFailed | FallbackReason::MicrophoneError => 3,
            FallbackReason::RtcConnectionFailed | FallbackReason::SevereNetworkIssue => 4,
        }
    }

}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackReason::PoorVideoQuality => "poor-video-quality",
            FallbackReason::HighPacketLoss => "high-packet-loss",
            FallbackReason::VideoTrackFailed => "video-track-failed",
            FallbackReason::CameraError => "camera-error",
            FallbackReason::AudioTrackFailed => "audio-track-failed",
            FallbackReason::MicrophoneError => "microphone-error",
            FallbackReason::RtcConnectionFailed => "rtc-connection-failed",
            FallbackReason::SevereNetworkIssue => "severe-network-issue",
            FallbackReason::LowBandwidth => "low-bandwidth",
            FallbackReason::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Which fallback modes a deployment has enabled. `FullVideo` is always
/// available; disabling a mode makes the chain skip past it.
#[derive(Debug, Clone, Copy)]
pub struct ModePolicy {
    pub enable_reduced_video: bool,
    pub enable_audio_only: bool,
    pub enable_chat_fallback: bool,
}

impl Default for ModePolicy {
    fn default() -> Self {
        Self {
            enable_reduced_video: true,
            enable_audio_only: true,
            enable_chat_fallback: true,
        }
    }
}

impl ModePolicy {
    #[must_use]
    pub fn is_enabled(&self, mode: OperatingMode) -> bool {
        match mode {
            OperatingMode::FullVideo => true,
            OperatingMode::ReducedVideo => self.enable_reduced_video,
            OperatingMode::AudioOnly => self.enable_audio_only,
            OperatingMode::ChatOnly => self.enable_chat_fallback,
        }
    }

    /// Enabled modes, best first.
    #[must_use]
    pub fn available_modes(&self) -> Vec<OperatingMode> {
        FALLBACK_CHAIN
            .iter()
            .copied()
            .filter(|m| self.is_enabled(*m))
            .collect()
    }

    /// The deepest enabled mode; failure there is terminal.
    #[must_use]
    pub fn floor(&self) -> OperatingMode {
        FALLBACK_CHAIN
            .iter()
            .copied()
            .rev()
            .find(|m| self.is_enabled(*m))
            .unwrap_or(OperatingMode::FullVideo)
    }

    /// The next enabled mode strictly deeper than `mode`.
    #[must_use]
    pub fn next_enabled_below(&self, mode: OperatingMode) -> Option<OperatingMode> {
        FALLBACK_CHAIN
            .iter()
            .copied()
            .find(|m| *m > mode && self.is_enabled(*m))
    }

    /// Resolve a raw target to an enabled mode at the same depth or
    /// deeper. Returns `None` when every candidate at or below `raw` is
    /// disabled.
    #[must_use]
    pub fn deepen_to_enabled(&self, raw: OperatingMode) -> Option<OperatingMode> {
        FALLBACK_CHAIN
            .iter()
            .copied()
            .find(|m| *m >= raw && self.is_enabled(*m))
    }
}

/// Resolve the degrade target for `(reason, current, level)`.
///
/// Degrading never improves the mode: the resolved target is clamped to
/// be at least as deep as `current`, then pushed past any disabled modes.
/// When everything at or below the raw target is disabled, the current
/// mode is returned (no-op).
#[must_use]
pub fn resolve_target(
    reason: FallbackReason,
    current: OperatingMode,
    level: QualityLevel,
    policy: &ModePolicy,
) -> OperatingMode {
    let raw = match reason {
        FallbackReason::PoorVideoQuality | FallbackReason::HighPacketLoss => {
            if current == OperatingMode::FullVideo {
                OperatingMode::ReducedVideo
            } else {
                OperatingMode::AudioOnly
            }
        }
        FallbackReason::VideoTrackFailed | FallbackReason::CameraError => {
            OperatingMode::AudioOnly
        }
        FallbackReason::AudioTrackFailed | FallbackReason::MicrophoneError => {
            OperatingMode::ChatOnly
        }
        FallbackReason::RtcConnectionFailed | FallbackReason::SevereNetworkIssue => {
            OperatingMode::ChatOnly
        }
        FallbackReason::LowBandwidth => {
            if current == OperatingMode::FullVideo && level.meets(QualityLevel::Fair) {
                OperatingMode::ReducedVideo
            } else {
                OperatingMode::AudioOnly
            }
        }
        FallbackReason::Manual => current.next_degraded().unwrap_or(OperatingMode::ChatOnly),
    };

    let clamped = raw.max(current);
    policy.deepen_to_enabled(clamped).unwrap_or(current)
}
