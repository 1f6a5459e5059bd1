//! Text-fallback channel collaborator.
//!
//! Used only when `ChatOnly` is active or being entered. The engine
//! observes connect/disconnect lifecycle events through a channel handed
//! in at construction; losing chat while already at the floor is the one
//! terminal failure the engine cannot step down from.

use crate::errors::EngineError;
use async_trait::async_trait;

/// Lifecycle events from the chat channel.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Connected,
    Disconnected { reason: String },
}

/// External text-fallback channel.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Establish the chat connection. Called when entering `ChatOnly`.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Tear down the chat connection. Must be safe when not connected.
    async fn disconnect(&self);

    /// Current connected/disconnected status flag.
    fn is_connected(&self) -> bool;
}
