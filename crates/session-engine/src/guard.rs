//! Session teardown.
//!
//! [`SessionResourceGuard`] is the single place the session ends. Every
//! exit path funnels through [`SessionResourceGuard::teardown`], which
//! releases everything in a fixed order and is idempotent, so racing exit
//! signals (explicit leave, page hide, transport death) cannot double-free
//! or leak a capture.

use crate::fallback::SessionResources;
use crate::media::{TrackKind, WakeLockHandle};

use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The user asked to leave.
    Explicit,
    /// The page or app was hidden and the platform reclaimed the session.
    VisibilityLost,
    /// The user navigated away mid-session.
    NavigatedAway,
    /// The mode hierarchy was exhausted or the chat floor failed.
    Fatal,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Explicit => "explicit",
            EndReason::VisibilityLost => "visibility-lost",
            EndReason::NavigatedAway => "navigated-away",
            EndReason::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Owns the cancellation token and wake lock, and runs final teardown.
pub struct SessionResourceGuard {
    cancel: CancellationToken,
    wake_lock: Option<WakeLockHandle>,
    ended: bool,
}

impl SessionResourceGuard {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            wake_lock: None,
            ended: false,
        }
    }

    /// Hand over a held wake lock for release at teardown.
    pub fn set_wake_lock(&mut self, handle: WakeLockHandle) {
        self.wake_lock = Some(handle);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Release everything, in order: cancel background tasks, unpublish,
    /// stop captures, drop the wake lock, leave the transport, disconnect
    /// chat. Safe to call more than once; only the first call acts.
    ///
    /// Failures along the way are logged and skipped over, never
    /// propagated: a dead transport must not prevent capture release.
    pub async fn teardown(&mut self, reason: EndReason, res: &mut SessionResources) {
        if self.ended {
            debug!(target: "engine.guard", reason = %reason, "Teardown already ran, ignoring");
            return;
        }
        self.ended = true;
        info!(target: "engine.guard", reason = %reason, "Session teardown started");

        self.cancel.cancel();

        if let Err(e) = res
            .transport
            .unpublish(&[TrackKind::Audio, TrackKind::Video, TrackKind::Screen])
            .await
        {
            warn!(target: "engine.guard", error = %e, "Unpublish during teardown failed");
        }
        res.provider.release_all().await;

        if let Some(handle) = self.wake_lock.take() {
            res.provider.release_wake_lock(handle).await;
        }

        if let Err(e) = res.transport.leave().await {
            warn!(target: "engine.guard", error = %e, "Leave during teardown failed");
        }
        res.chat.disconnect().await;

        info!(target: "engine.guard", reason = %reason, "Session teardown complete");
    }
}

impl fmt::Debug for SessionResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResourceGuard")
            .field("ended", &self.ended)
            .field("wake_lock_held", &self.wake_lock.is_some())
            .finish()
    }
}
