//! The adaptive fallback core: operating modes, trigger reasons, the
//! reason→target table, and the state machine that drives transitions.

mod machine;
mod modes;
mod reasons;

pub use machine::{
    FallbackStateMachine, RecoveryOutcome, SessionResources, SessionStatus, TransitionPhase,
    TransitionRecord, TriggerOutcome,
};
pub use modes::{ModeRequirements, OperatingMode, FALLBACK_CHAIN};
pub use reasons::{resolve_target, FallbackReason, ModePolicy};
