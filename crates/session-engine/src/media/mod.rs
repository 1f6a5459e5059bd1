//! Local media capture: track handles, encoder profiles, and the provider
//! that owns acquisition/release of camera, microphone, and screen tracks.

mod provider;
mod tracks;

pub use provider::{MediaDevice, MediaTrackProvider, WakeLockHandle};
pub use tracks::{EncoderProfile, LocalTrack, MediaTrackSet, TrackKind};
