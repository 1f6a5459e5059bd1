//! Transport session wrapper.
//!
//! [`TransportSession`] owns the handle to the real-time transport for the
//! whole session. It tracks channel membership and the set of published
//! track kinds; every publish/unpublish funnels through the fallback state
//! machine, so the wrapper itself stays a thin bookkeeping layer. The
//! transport's internal reconnection is observed through
//! [`TransportEvent::ConnectionState`], never re-implemented here.

use crate::errors::EngineError;
use crate::media::{LocalTrack, TrackKind};
use crate::quality::QualitySample;
use crate::transport::token::CredentialToken;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection state of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Events emitted by the transport provider.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection state changed, with the provider's reason code.
    ConnectionState {
        current: ConnectionState,
        previous: ConnectionState,
        reason: String,
    },
    /// Periodic network quality report.
    Quality(QualitySample),
    /// The current token is about to expire (provider-side warning).
    TokenWillExpire,
}

/// External real-time transport collaborator.
///
/// Implementations push their callbacks into the event channel handed to
/// the engine at construction; the trait covers only the imperative side.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(
        &self,
        channel: &str,
        token: &CredentialToken,
        identity: &str,
    ) -> Result<(), EngineError>;

    async fn leave(&self) -> Result<(), EngineError>;

    async fn publish(&self, tracks: &[LocalTrack]) -> Result<(), EngineError>;

    async fn unpublish(&self, kinds: &[TrackKind]) -> Result<(), EngineError>;

    async fn renew_token(&self, token: &CredentialToken) -> Result<(), EngineError>;
}

/// Bookkeeping wrapper around the transport handle.
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    channel: String,
    identity: String,
    joined: bool,
    published: BTreeSet<TrackKind>,
}

impl TransportSession {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, channel: String, identity: String) -> Self {
        Self {
            transport,
            channel,
            identity,
            joined: false,
            published: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Kinds currently live on the wire.
    #[must_use]
    pub fn published_kinds(&self) -> Vec<TrackKind> {
        self.published.iter().copied().collect()
    }

    #[must_use]
    pub fn is_published(&self, kind: TrackKind) -> bool {
        self.published.contains(&kind)
    }

    /// Join the configured channel. Joining an already-joined session is a
    /// no-op.
    pub async fn join(&mut self, token: &CredentialToken) -> Result<(), EngineError> {
        if self.joined {
            return Ok(());
        }
        self.transport
            .join(&self.channel, token, &self.identity)
            .await?;
        self.joined = true;
        info!(
            target: "engine.transport",
            channel = %self.channel,
            identity = %self.identity,
            "Joined channel"
        );
        Ok(())
    }

    /// Leave the channel. Leaving when not joined is a no-op; the
    /// published set is cleared because nothing survives a leave.
    pub async fn leave(&mut self) -> Result<(), EngineError> {
        if !self.joined {
            return Ok(());
        }
        // Mark left before awaiting so a failed leave is not retried
        // against a dead handle.
        self.joined = false;
        self.published.clear();
        self.transport.leave().await?;
        info!(target: "engine.transport", channel = %self.channel, "Left channel");
        Ok(())
    }

    /// Publish tracks. Failures are reported synchronously to the caller.
    pub async fn publish(&mut self, tracks: &[LocalTrack]) -> Result<(), EngineError> {
        if !self.joined {
            return Err(EngineError::TransportConnection(
                "publish before join".to_string(),
            ));
        }
        let to_publish: Vec<LocalTrack> = tracks
            .iter()
            .filter(|t| !self.published.contains(&t.kind()))
            .cloned()
            .collect();
        if to_publish.is_empty() {
            return Ok(());
        }
        self.transport.publish(&to_publish).await?;
        for track in &to_publish {
            self.published.insert(track.kind());
            debug!(
                target: "engine.transport",
                kind = %track.kind(),
                track_id = %track.id(),
                "Track published"
            );
        }
        Ok(())
    }

    /// Unpublish the given kinds. Kinds not currently published are
    /// skipped.
    pub async fn unpublish(&mut self, kinds: &[TrackKind]) -> Result<(), EngineError> {
        let live: Vec<TrackKind> = kinds
            .iter()
            .copied()
            .filter(|k| self.published.contains(k))
            .collect();
        if live.is_empty() {
            return Ok(());
        }
        self.transport.unpublish(&live).await?;
        for kind in &live {
            self.published.remove(kind);
            debug!(target: "engine.transport", kind = %kind, "Track unpublished");
        }
        Ok(())
    }

    /// Apply a renewed credential to the live connection.
    pub async fn renew_token(&mut self, token: &CredentialToken) -> Result<(), EngineError> {
        if !self.joined {
            debug!(
                target: "engine.transport",
                "Token renewal skipped, not joined"
            );
            return Ok(());
        }
        match self.transport.renew_token(token).await {
            Ok(()) => {
                debug!(target: "engine.transport", "Transport credential renewed");
                Ok(())
            }
            Err(e) => {
                warn!(target: "engine.transport", error = %e, "Transport rejected renewed credential");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("channel", &self.channel)
            .field("identity", &self.identity)
            .field("joined", &self.joined)
            .field("published", &self.published)
            .finish()
    }
}
