//! Operating modes and their fixed hierarchy.
//!
//! The four modes form a total order by priority (1 = best). Exactly one
//! mode is current at any instant; the order never changes for the
//! lifetime of the process. Each mode declares the resources it needs and
//! the minimum damped quality level required to enter or remain in it.

use crate::quality::QualityLevel;
use serde::Serialize;
use std::fmt;

/// Resource requirements of an operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeRequirements {
    pub needs_video: bool,
    pub needs_audio: bool,
    pub needs_transport: bool,
}

/// One of the four ordered fallback levels.
///
/// The derived ordering follows priority: `FullVideo < ChatOnly`, so
/// `a < b` reads as "a is a richer mode than b".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    FullVideo,
    ReducedVideo,
    AudioOnly,
    ChatOnly,
}

/// The canonical hierarchy, best first.
pub const FALLBACK_CHAIN: [OperatingMode; 4] = [
    OperatingMode::FullVideo,
    OperatingMode::ReducedVideo,
    OperatingMode::AudioOnly,
    OperatingMode::ChatOnly,
];

impl OperatingMode {
    /// Priority: 1 = best, increasing = more degraded.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            OperatingMode::FullVideo => 1,
            OperatingMode::ReducedVideo => 2,
            OperatingMode::AudioOnly => 3,
            OperatingMode::ChatOnly => 4,
        }
    }

    /// Human-readable label for the presentation layer.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            OperatingMode::FullVideo => "Full video",
            OperatingMode::ReducedVideo => "Reduced video",
            OperatingMode::AudioOnly => "Audio only",
            OperatingMode::ChatOnly => "Chat only",
        }
    }

    #[must_use]
    pub fn requirements(self) -> ModeRequirements {
        match self {
            OperatingMode::FullVideo | OperatingMode::ReducedVideo => ModeRequirements {
                needs_video: true,
                needs_audio: true,
                needs_transport: true,
            },
            OperatingMode::AudioOnly => ModeRequirements {
                needs_video: false,
                needs_audio: true,
                needs_transport: true,
            },
            OperatingMode::ChatOnly => ModeRequirements {
                needs_video: false,
                needs_audio: false,
                needs_transport: false,
            },
        }
    }

    /// Minimum damped quality level required to enter or remain in this
    /// mode. A fixed table, strictest at the top of the hierarchy.
    #[must_use]
    pub fn min_quality(self) -> QualityLevel {
        match self {
            OperatingMode::FullVideo => QualityLevel::Good,
            OperatingMode::ReducedVideo => QualityLevel::Fair,
            OperatingMode::AudioOnly => QualityLevel::Bad,
            OperatingMode::ChatOnly => QualityLevel::Unusable,
        }
    }

    /// Whether `level` satisfies this mode's minimum requirement.
    #[must_use]
    pub fn admits(self, level: QualityLevel) -> bool {
        level.meets(self.min_quality())
    }

    /// The next more-degraded mode, if any.
    #[must_use]
    pub fn next_degraded(self) -> Option<OperatingMode> {
        match self {
            OperatingMode::FullVideo => Some(OperatingMode::ReducedVideo),
            OperatingMode::ReducedVideo => Some(OperatingMode::AudioOnly),
            OperatingMode::AudioOnly => Some(OperatingMode::ChatOnly),
            OperatingMode::ChatOnly => None,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatingMode::FullVideo => "full-video",
            OperatingMode::ReducedVideo => "reduced-video",
            OperatingMode::AudioOnly => "audio-only",
            OperatingMode::ChatOnly => "chat-only",
        };
        write!(f, "{s}")
    }
}
