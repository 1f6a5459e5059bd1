//! Client-side live session engine with adaptive fallback.
//!
//! Keeps a creator/viewer session alive as conditions worsen by stepping
//! down an ordered mode hierarchy — full video, reduced video, audio only,
//! chat only — and stepping back up when conditions recover. The engine
//! runs as an actor; the transport, capture devices, chat channel, and
//! credential service are injected collaborators behind traits.

#![warn(clippy::pedantic)]

/// Module for the chat fallback channel collaborator
pub mod chat;

/// Module for engine configuration
pub mod config;

/// Module for the session engine actor and its handle
pub mod engine;

/// Module for error types
pub mod errors;

/// Module for the fallback event bus
pub mod events;

/// Module for operating modes, trigger reasons, and the state machine
pub mod fallback;

/// Module for session teardown
pub mod guard;

/// Module for capture devices and local tracks
pub mod media;

/// Module for network quality classification
pub mod quality;

/// Module for the transport session and credential renewal
pub mod transport;

pub use chat::{ChatChannel, ChatEvent};
pub use config::{ConfigError, EngineConfig};
pub use engine::{SessionEngine, SessionEngineHandle};
pub use errors::{DeviceError, DeviceErrorKind, EngineError};
pub use events::{EventKind, FallbackEvent, FallbackEventBus, Subscription};
pub use fallback::{
    FallbackReason, FallbackStateMachine, ModePolicy, OperatingMode, RecoveryOutcome,
    SessionStatus, TriggerOutcome,
};
pub use guard::{EndReason, SessionResourceGuard};
pub use media::{
    EncoderProfile, LocalTrack, MediaDevice, MediaTrackProvider, TrackKind, WakeLockHandle,
};
pub use quality::{QualityClassifier, QualityLevel, QualitySample};
pub use transport::{
    ConnectionState, CredentialToken, TokenFetcher, Transport, TransportEvent, TransportSession,
};
