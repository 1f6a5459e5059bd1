//! Local media track handles and encoder profiles.
//!
//! A [`LocalTrack`] is a lightweight handle to a capture resource owned by
//! the device layer. The engine moves handles between the provider and the
//! transport; the underlying hardware capture is only ever stopped through
//! [`crate::media::MediaTrackProvider`].

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Kind of a local capture track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
            TrackKind::Screen => write!(f, "screen"),
        }
    }
}

/// Encoder configuration for a video track.
///
/// The engine does not invent these numbers; they are injected presets the
/// transition procedures apply when stepping between video modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_bitrate_kbps: u32,
}

impl EncoderProfile {
    /// Full-quality profile used in `FullVideo` mode.
    #[must_use]
    pub fn full() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            max_bitrate_kbps: 1700,
        }
    }

    /// Reduced profile applied when degrading to `ReducedVideo`.
    #[must_use]
    pub fn reduced() -> Self {
        Self {
            width: 640,
            height: 360,
            frame_rate: 15,
            max_bitrate_kbps: 400,
        }
    }
}

/// Handle to a live local capture track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    profile: Option<EncoderProfile>,
}

impl LocalTrack {
    /// Create a handle for a newly opened capture.
    #[must_use]
    pub fn new(kind: TrackKind, profile: Option<EncoderProfile>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            profile,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn profile(&self) -> Option<EncoderProfile> {
        self.profile
    }

    /// Record the encoder profile currently applied to this track.
    pub fn set_profile(&mut self, profile: EncoderProfile) {
        self.profile = Some(profile);
    }
}

/// The set of local tracks the provider currently owns.
///
/// At most one live track per kind. A track handed to the transport for
/// publishing stays in this set; the provider only stops the underlying
/// capture after the transport has released it (unpublish before stop).
#[derive(Debug, Default)]
pub struct MediaTrackSet {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

impl MediaTrackSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Screen => self.screen.as_ref(),
        }
    }

    pub fn get_mut(&mut self, kind: TrackKind) -> Option<&mut LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_mut(),
            TrackKind::Video => self.video.as_mut(),
            TrackKind::Screen => self.screen.as_mut(),
        }
    }

    /// Insert a track, returning the previous one of that kind if any.
    pub fn insert(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        let slot = match track.kind() {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
            TrackKind::Screen => &mut self.screen,
        };
        slot.replace(track)
    }

    /// Remove and return the track of the given kind.
    pub fn take(&mut self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.take(),
            TrackKind::Video => self.video.take(),
            TrackKind::Screen => self.screen.take(),
        }
    }

    /// Kinds with a live track, in stable order.
    #[must_use]
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio.is_some() {
            kinds.push(TrackKind::Audio);
        }
        if self.video.is_some() {
            kinds.push(TrackKind::Video);
        }
        if self.screen.is_some() {
            kinds.push(TrackKind::Screen);
        }
        kinds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.screen.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_display() {
        assert_eq!(TrackKind::Audio.to_string(), "audio");
        assert_eq!(TrackKind::Video.to_string(), "video");
        assert_eq!(TrackKind::Screen.to_string(), "screen");
    }

    #[test]
    fn test_encoder_profiles_are_ordered() {
        let full = EncoderProfile::full();
        let reduced = EncoderProfile::reduced();

        assert!(reduced.width < full.width);
        assert!(reduced.frame_rate < full.frame_rate);
        assert!(reduced.max_bitrate_kbps < full.max_bitrate_kbps);
    }

    #[test]
    fn test_track_ids_are_unique() {
        let a = LocalTrack::new(TrackKind::Audio, None);
        let b = LocalTrack::new(TrackKind::Audio, None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_track_set_insert_take() {
        let mut set = MediaTrackSet::new();
        assert!(set.is_empty());

        let video = LocalTrack::new(TrackKind::Video, Some(EncoderProfile::full()));
        assert!(set.insert(video).is_none());
        assert_eq!(set.kinds(), vec![TrackKind::Video]);

        let taken = set.take(TrackKind::Video).unwrap();
        assert_eq!(taken.kind(), TrackKind::Video);
        assert!(set.is_empty());

        // Taking again is a no-op
        assert!(set.take(TrackKind::Video).is_none());
    }

    #[test]
    fn test_track_set_insert_replaces_same_kind() {
        let mut set = MediaTrackSet::new();
        let first = LocalTrack::new(TrackKind::Audio, None);
        let first_id = first.id().to_string();
        set.insert(first);

        let replaced = set.insert(LocalTrack::new(TrackKind::Audio, None)).unwrap();
        assert_eq!(replaced.id(), first_id);
        assert_eq!(set.kinds().len(), 1);
    }

    #[test]
    fn test_set_profile_updates_handle() {
        let mut track = LocalTrack::new(TrackKind::Video, Some(EncoderProfile::full()));
        track.set_profile(EncoderProfile::reduced());
        assert_eq!(track.profile(), Some(EncoderProfile::reduced()));
    }
}
