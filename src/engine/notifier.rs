//! Event fan-out to external observers
//!
//! Emission never blocks the engine loop: every subscriber owns an
//! unbounded queue and drains it at its own pace, in emission order.

use crate::domain::event::Event;
use futures::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Identifies one event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered stream of engine events for one subscriber.
pub struct EventStream {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next event; `None` once the engine has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

/// Engine-side event dispatcher.
pub struct EventNotifier {
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<Event>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self) -> EventStream {
        let id = SubscriberId(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        debug!("Subscriber {} attached", id);
        EventStream { id, rx }
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            debug!("Subscriber {} detached", id);
        }
    }

    /// Deliver an event to every live subscriber. Subscribers whose
    /// stream has been dropped are pruned here.
    pub fn emit(&mut self, event: Event) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registration::RegistrationState;

    #[tokio::test]
    async fn test_emit_in_order() {
        let mut notifier = EventNotifier::new();
        let mut stream = notifier.subscribe();

        notifier.emit(Event::registration_changed(RegistrationState::Registering));
        notifier.emit(Event::registration_changed(RegistrationState::Registered));

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert!(format!("{:?}", first.kind).contains("Registering"));
        assert!(format!("{:?}", second.kind).contains("Registered"));
    }

    #[tokio::test]
    async fn test_unsubscribe_always_succeeds() {
        let mut notifier = EventNotifier::new();
        let stream = notifier.subscribe();
        let id = stream.id();

        notifier.unsubscribe(id);
        assert_eq!(notifier.subscriber_count(), 0);

        // Unknown id is fine too
        notifier.unsubscribe(id);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let mut notifier = EventNotifier::new();
        let stream = notifier.subscribe();
        drop(stream);

        notifier.emit(Event::registration_changed(RegistrationState::Registered));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_impl() {
        use futures::StreamExt;

        let mut notifier = EventNotifier::new();
        let mut stream = notifier.subscribe();

        notifier.emit(Event::registration_changed(RegistrationState::Registered));
        let event = stream.next().await.unwrap();
        assert!(format!("{:?}", event.kind).contains("Registered"));
    }
}
