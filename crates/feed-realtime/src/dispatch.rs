use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use feed_proto::destination::{CHAT_TOPIC_PREFIX, NOTIFICATION_TOPIC_PREFIX};
use feed_proto::{ChatMessage, NotificationRecord, PushEvent};
use parking_lot::RwLock;
use push_transport::Frame;
use tracing::{debug, error, trace, warn};

use crate::connection::ChannelKind;
use crate::error::DecodeError;

/// Receives the typed push events of one subscription.
pub trait PushHandler: Send + Sync {
    fn handle(&self, event: PushEvent);
}

impl<F> PushHandler for F
where
    F: Fn(PushEvent) + Send + Sync,
{
    fn handle(&self, event: PushEvent) {
        self(event)
    }
}

/// Identity of a subscription: the channel it lives on plus a caller-chosen
/// key (a recipient id, a conversation key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: ChannelKind,
    pub logical_key: String,
}

impl SubscriptionKey {
    pub fn new(channel: ChannelKind, logical_key: impl Into<String>) -> Self {
        Self {
            channel,
            logical_key: logical_key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Decoded, but no subscription owns the destination.
    Unrouted,
    /// Undecodable frame, logged and discarded.
    Dropped,
    HandlerPanicked,
}

struct Route {
    destination: String,
    handler: Arc<dyn PushHandler>,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<SubscriptionKey, Route>,
    by_destination: HashMap<(ChannelKind, String), SubscriptionKey>,
}

/// Turns raw frames into [`PushEvent`]s and hands each to the single
/// subscription that owns it.
#[derive(Default)]
pub struct EventDispatcher {
    table: RwLock<RouteTable>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The destination decides the payload type.
    pub fn decode(frame: &Frame) -> Result<PushEvent, DecodeError> {
        let destination = frame.destination.as_str();
        let malformed = |source| DecodeError::Malformed {
            destination: destination.to_string(),
            source,
        };
        if destination.starts_with(NOTIFICATION_TOPIC_PREFIX) {
            serde_json::from_slice::<NotificationRecord>(&frame.body)
                .map(PushEvent::Notification)
                .map_err(malformed)
        } else if destination.starts_with(CHAT_TOPIC_PREFIX) {
            serde_json::from_slice::<ChatMessage>(&frame.body)
                .map(PushEvent::ChatMessage)
                .map_err(malformed)
        } else {
            Err(DecodeError::UnknownDestination(destination.to_string()))
        }
    }

    /// Returns false when the key already has a route, or when another key
    /// already owns the destination on that channel.
    pub fn add_route(
        &self,
        key: SubscriptionKey,
        destination: String,
        handler: Arc<dyn PushHandler>,
    ) -> bool {
        let mut table = self.table.write();
        if table.routes.contains_key(&key) {
            return false;
        }
        let index = (key.channel, destination.clone());
        if let Some(owner) = table.by_destination.get(&index) {
            warn!(
                target: "realtime.dispatch",
                channel = %key.channel,
                destination = %destination,
                key = %key.logical_key,
                owner = %owner.logical_key,
                "destination already routed to another subscription"
            );
            return false;
        }
        table.by_destination.insert(index, key.clone());
        table.routes.insert(
            key,
            Route {
                destination,
                handler,
            },
        );
        true
    }

    pub fn remove_route(&self, key: &SubscriptionKey) -> bool {
        let mut table = self.table.write();
        let Some(route) = table.routes.remove(key) else {
            return false;
        };
        let index = (key.channel, route.destination);
        if table.by_destination.get(&index) == Some(key) {
            table.by_destination.remove(&index);
        }
        true
    }

    pub fn route_count(&self) -> usize {
        self.table.read().routes.len()
    }

    /// Decodes a frame received on `channel` and dispatches it. Never fails:
    /// bad frames are logged and dropped so the connection stays up.
    pub fn route_frame(&self, channel: ChannelKind, frame: &Frame) -> DispatchOutcome {
        let event = match Self::decode(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    target: "realtime.dispatch",
                    channel = %channel,
                    destination = %frame.destination,
                    error = %err,
                    "dropping undecodable frame"
                );
                return DispatchOutcome::Dropped;
            }
        };
        let key = self
            .table
            .read()
            .by_destination
            .get(&(channel, frame.destination.clone()))
            .cloned();
        match key {
            Some(key) => self.dispatch(&key, event),
            None => {
                debug!(
                    target: "realtime.dispatch",
                    channel = %channel,
                    destination = %frame.destination,
                    "no subscription owns destination"
                );
                DispatchOutcome::Unrouted
            }
        }
    }

    pub fn dispatch(&self, key: &SubscriptionKey, event: PushEvent) -> DispatchOutcome {
        let handler = self
            .table
            .read()
            .routes
            .get(key)
            .map(|route| Arc::clone(&route.handler));
        let Some(handler) = handler else {
            return DispatchOutcome::Unrouted;
        };
        let event_id = event.id();
        match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(()) => {
                trace!(
                    target: "realtime.dispatch",
                    channel = %key.channel,
                    key = %key.logical_key,
                    event_id = %event_id,
                    "event dispatched"
                );
                DispatchOutcome::Delivered
            }
            Err(_) => {
                error!(
                    target: "realtime.dispatch",
                    channel = %key.channel,
                    key = %key.logical_key,
                    event_id = %event_id,
                    "push handler panicked; event discarded"
                );
                DispatchOutcome::HandlerPanicked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn notification_frame(id: i64) -> Frame {
        let body = serde_json::json!({
            "id": id,
            "type": "OPINION",
            "senderId": 3,
            "recipientId": 7,
            "message": "new opinion",
            "status": "UNREAD",
            "timestamp": "2024-05-01T10:15:30"
        });
        Frame::new("/topic/notifications/7", body.to_string())
    }

    fn recording_route(dispatcher: &EventDispatcher, key: SubscriptionKey, destination: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.add_route(
            key,
            destination.to_string(),
            Arc::new(move |event: PushEvent| sink.lock().push(event.id())),
        );
        seen
    }

    #[test]
    fn decodes_by_destination_prefix() {
        let event = EventDispatcher::decode(&notification_frame(11)).expect("decode");
        assert!(matches!(event, PushEvent::Notification(ref r) if r.id == 11));

        let chat = Frame::new(
            "/topic/chat/1-2",
            r#"{"id":"m1","senderId":1,"recipientId":2,"content":"hi","timestamp":"2024-05-01T10:00:00"}"#,
        );
        assert!(matches!(
            EventDispatcher::decode(&chat),
            Ok(PushEvent::ChatMessage(_))
        ));

        let elsewhere = Frame::new("/topic/presence/1", "{}");
        assert!(matches!(
            EventDispatcher::decode(&elsewhere),
            Err(DecodeError::UnknownDestination(_))
        ));
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let dispatcher = EventDispatcher::new();
        let seen = recording_route(
            &dispatcher,
            SubscriptionKey::new(ChannelKind::Notifications, "7"),
            "/topic/notifications/7",
        );
        let garbage = Frame::new("/topic/notifications/7", "{not json");
        assert_eq!(
            dispatcher.route_frame(ChannelKind::Notifications, &garbage),
            DispatchOutcome::Dropped
        );
        assert_eq!(
            dispatcher.route_frame(ChannelKind::Notifications, &notification_frame(4)),
            DispatchOutcome::Delivered
        );
        assert_eq!(*seen.lock(), vec!["4".to_string()]);
    }

    /// Records the target of every event it sees.
    struct Targets(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Targets {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().push(event.metadata().target().to_string());
        }
    }

    #[test]
    fn drops_are_logged_under_the_dispatch_target() {
        use tracing_subscriber::layer::SubscriberExt;

        let targets = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Targets(Arc::clone(&targets)));
        tracing::subscriber::with_default(subscriber, || {
            let dispatcher = EventDispatcher::new();
            let garbage = Frame::new("/topic/notifications/7", "{not json");
            dispatcher.route_frame(ChannelKind::Notifications, &garbage);
        });
        assert_eq!(*targets.lock(), vec!["realtime.dispatch".to_string()]);
    }

    #[test]
    fn routes_only_to_the_owning_subscription() {
        let dispatcher = EventDispatcher::new();
        let mine = recording_route(
            &dispatcher,
            SubscriptionKey::new(ChannelKind::Notifications, "7"),
            "/topic/notifications/7",
        );
        let other = recording_route(
            &dispatcher,
            SubscriptionKey::new(ChannelKind::Notifications, "8"),
            "/topic/notifications/8",
        );
        dispatcher.route_frame(ChannelKind::Notifications, &notification_frame(1));
        assert_eq!(mine.lock().len(), 1);
        assert!(other.lock().is_empty());

        assert_eq!(
            dispatcher.route_frame(ChannelKind::Chat, &notification_frame(2)),
            DispatchOutcome::Unrouted
        );
    }

    #[test]
    fn second_owner_of_a_destination_is_refused() {
        let dispatcher = EventDispatcher::new();
        let first = SubscriptionKey::new(ChannelKind::Notifications, "7");
        let seen = recording_route(&dispatcher, first.clone(), "/topic/notifications/7");
        let late = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&late);
        assert!(!dispatcher.add_route(
            SubscriptionKey::new(ChannelKind::Notifications, "alias"),
            "/topic/notifications/7".into(),
            Arc::new(move |event: PushEvent| sink.lock().push(event.id())),
        ));
        assert_eq!(dispatcher.route_count(), 1);

        dispatcher.route_frame(ChannelKind::Notifications, &notification_frame(1));
        assert_eq!(*seen.lock(), vec!["1".to_string()]);
        assert!(late.lock().is_empty());

        // Once the owner is gone the destination is free again.
        assert!(dispatcher.remove_route(&first));
        let _ = recording_route(
            &dispatcher,
            SubscriptionKey::new(ChannelKind::Notifications, "alias"),
            "/topic/notifications/7",
        );
        assert_eq!(dispatcher.route_count(), 1);
    }

    #[test]
    fn panicking_handler_does_not_escape() {
        let dispatcher = EventDispatcher::new();
        let key = SubscriptionKey::new(ChannelKind::Notifications, "7");
        dispatcher.add_route(
            key.clone(),
            "/topic/notifications/7".into(),
            Arc::new(|_event: PushEvent| panic!("handler bug")),
        );
        assert_eq!(
            dispatcher.route_frame(ChannelKind::Notifications, &notification_frame(1)),
            DispatchOutcome::HandlerPanicked
        );
        assert!(dispatcher.remove_route(&key));
        assert!(!dispatcher.remove_route(&key));
        assert_eq!(dispatcher.route_count(), 0);
    }
}
