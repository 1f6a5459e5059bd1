//! Fallback event bus.
//!
//! The presentation layer consumes a typed publish/subscribe stream of
//! [`FallbackEvent`]s. Every subscription returns an explicit
//! [`Subscription`] guard that unsubscribes on drop, so listener lifetime
//! is owned rather than relying on callers to remember to unregister.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Kind of a fallback notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ManagerInitialized,
    FallbackStarted,
    FallbackCompleted,
    FallbackFailed,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    ChatFailure,
    TracksUpdated,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ManagerInitialized => "manager-initialized",
            EventKind::FallbackStarted => "fallback-started",
            EventKind::FallbackCompleted => "fallback-completed",
            EventKind::FallbackFailed => "fallback-failed",
            EventKind::RecoveryStarted => "recovery-started",
            EventKind::RecoveryCompleted => "recovery-completed",
            EventKind::RecoveryFailed => "recovery-failed",
            EventKind::ChatFailure => "chat-failure",
            EventKind::TracksUpdated => "tracks-updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable notification record. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FallbackEvent {
    #[must_use]
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

struct SubscriberEntry {
    id: u64,
    /// `None` subscribes to every kind.
    filter: Option<EventKind>,
    tx: mpsc::UnboundedSender<FallbackEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

/// Publish/subscribe surface for [`FallbackEvent`]s.
///
/// Cheap to clone; all clones share the subscriber registry.
#[derive(Clone, Default)]
pub struct FallbackEventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl FallbackEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    #[must_use]
    pub fn subscribe(
        &self,
        kind: EventKind,
    ) -> (Subscription, mpsc::UnboundedReceiver<FallbackEvent>) {
        self.register(Some(kind))
    }

    /// Subscribe to every event kind.
    #[must_use]
    pub fn subscribe_all(&self) -> (Subscription, mpsc::UnboundedReceiver<FallbackEvent>) {
        self.register(None)
    }

    fn register(
        &self,
        filter: Option<EventKind>,
    ) -> (Subscription, mpsc::UnboundedReceiver<FallbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(SubscriberEntry { id, filter, tx });

        let subscription = Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        };
        (subscription, rx)
    }

    /// Publish an event to all matching subscribers. Subscribers whose
    /// receivers have been dropped are pruned here.
    pub fn publish(&self, event: FallbackEvent) {
        trace!(target: "engine.events", kind = %event.kind, "Publishing event");
        let mut inner = self.lock();
        inner.subscribers.retain(|entry| {
            if entry.filter.is_some_and(|f| f != event.kind) {
                return !entry.tx.is_closed();
            }
            entry.tx.send(event.clone()).is_ok()
        });
    }

    /// Number of live subscriptions (for tests and diagnostics).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FallbackEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Guard tying a subscription's lifetime to its owner. Dropping it
/// unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|entry| entry.id != self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::ManagerInitialized.as_str(), "manager-initialized");
        assert_eq!(EventKind::FallbackStarted.as_str(), "fallback-started");
        assert_eq!(EventKind::ChatFailure.as_str(), "chat-failure");
        assert_eq!(EventKind::TracksUpdated.as_str(), "tracks-updated");

        let serialized = serde_json::to_string(&EventKind::RecoveryFailed).unwrap();
        assert_eq!(serialized, "\"recovery-failed\"");
    }

    #[test]
    fn test_subscribe_receives_matching_kind_only() {
        let bus = FallbackEventBus::new();
        let (_sub, mut rx) = bus.subscribe(EventKind::FallbackCompleted);

        bus.publish(FallbackEvent::new(EventKind::FallbackStarted, json!({})));
        bus.publish(FallbackEvent::new(
            EventKind::FallbackCompleted,
            json!({"to": "audio-only"}),
        ));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::FallbackCompleted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_all_receives_everything() {
        let bus = FallbackEventBus::new();
        let (_sub, mut rx) = bus.subscribe_all();

        bus.publish(FallbackEvent::new(EventKind::FallbackStarted, json!({})));
        bus.publish(FallbackEvent::new(EventKind::RecoveryStarted, json!({})));

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::FallbackStarted);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::RecoveryStarted);
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let bus = FallbackEventBus::new();
        let (sub, mut rx) = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(FallbackEvent::new(EventKind::FallbackStarted, json!({})));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned_on_publish() {
        let bus = FallbackEventBus::new();
        let (_sub, rx) = bus.subscribe(EventKind::FallbackStarted);
        drop(rx);

        bus.publish(FallbackEvent::new(EventKind::FallbackStarted, json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_each_get_a_copy() {
        let bus = FallbackEventBus::new();
        let (_s1, mut rx1) = bus.subscribe(EventKind::TracksUpdated);
        let (_s2, mut rx2) = bus.subscribe_all();

        bus.publish(FallbackEvent::new(
            EventKind::TracksUpdated,
            json!({"published": ["audio"]}),
        ));

        assert_eq!(rx1.try_recv().unwrap().kind, EventKind::TracksUpdated);
        assert_eq!(rx2.try_recv().unwrap().kind, EventKind::TracksUpdated);
    }
}
