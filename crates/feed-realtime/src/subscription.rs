//! Active push subscriptions, independent of transport state.
//!
//! Transport sessions forget their subscriptions when they close, so the
//! registry keeps the set itself and replays it on every `Connected`
//! transition of a channel. Each entry remembers which session it is bound
//! to, which keeps a subscribe that races with a replay from binding twice.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use push_transport::{Frame, SubscriptionId, TransportSession};
use tracing::{debug, info, warn};

use crate::connection::{ChannelKind, ConnectionHandle, ConnectionListener, ListenerId};
use crate::dispatch::{EventDispatcher, PushHandler, SubscriptionKey};

struct Binding {
    session_id: u64,
    subscription: SubscriptionId,
}

struct Entry {
    destination: String,
    binding: Option<Binding>,
}

struct Attachment {
    connection: ConnectionHandle,
    listener: ListenerId,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionKey, Entry>,
    attachments: HashMap<ChannelKind, Attachment>,
}

struct RegistryInner {
    dispatcher: EventDispatcher,
    state: Mutex<RegistryState>,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dispatcher: EventDispatcher::new(),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Adds a subscription on `connection`'s channel. `destination` builds
    /// the push destination from the logical key. Returns false, without
    /// touching the existing entry, when the key is already active or its
    /// destination is owned by another key.
    pub fn subscribe<D, H>(
        &self,
        connection: &ConnectionHandle,
        logical_key: impl Into<String>,
        destination: D,
        handler: H,
    ) -> bool
    where
        D: FnOnce(&str) -> String,
        H: PushHandler + 'static,
    {
        let channel = connection.channel();
        let key = SubscriptionKey::new(channel, logical_key);
        let mut state = self.inner.state.lock();
        if state.entries.contains_key(&key) {
            debug!(
                target: "realtime.subscription",
                channel = %channel,
                key = %key.logical_key,
                "already subscribed"
            );
            return false;
        }

        let destination = destination(&key.logical_key);
        if !self
            .inner
            .dispatcher
            .add_route(key.clone(), destination.clone(), Arc::new(handler))
        {
            return false;
        }
        self.attach(&mut state, connection);

        let mut entry = Entry {
            destination,
            binding: None,
        };
        if let Some(session) = connection.current_session() {
            bind(&key, &mut entry, &session);
        }
        info!(
            target: "realtime.subscription",
            channel = %channel,
            key = %key.logical_key,
            destination = %entry.destination,
            bound = entry.binding.is_some(),
            "subscribed"
        );
        state.entries.insert(key, entry);
        true
    }

    pub fn unsubscribe(&self, channel: ChannelKind, logical_key: &str) -> bool {
        let key = SubscriptionKey::new(channel, logical_key);
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.remove(&key) else {
            return false;
        };
        self.inner.dispatcher.remove_route(&key);
        let session = state
            .attachments
            .get(&channel)
            .and_then(|attachment| attachment.connection.current_session());
        release(&key, entry, session.as_ref());
        true
    }

    /// Drops every subscription of `channel` and stops listening to its
    /// connection.
    pub fn unsubscribe_channel(&self, channel: ChannelKind) -> usize {
        let mut state = self.inner.state.lock();
        let keys: Vec<SubscriptionKey> = state
            .entries
            .keys()
            .filter(|key| key.channel == channel)
            .cloned()
            .collect();
        let attachment = state.attachments.remove(&channel);
        let session = attachment
            .as_ref()
            .and_then(|attachment| attachment.connection.current_session());
        for key in &keys {
            if let Some(entry) = state.entries.remove(key) {
                self.inner.dispatcher.remove_route(key);
                release(key, entry, session.as_ref());
            }
        }
        if let Some(attachment) = attachment {
            attachment.connection.detach_listener(attachment.listener);
        }
        debug!(
            target: "realtime.subscription",
            channel = %channel,
            removed = keys.len(),
            "channel subscriptions cleared"
        );
        keys.len()
    }

    pub fn unsubscribe_all(&self) -> usize {
        let channels: Vec<ChannelKind> = {
            let state = self.inner.state.lock();
            let mut channels: Vec<ChannelKind> = state
                .entries
                .keys()
                .map(|key| key.channel)
                .chain(state.attachments.keys().copied())
                .collect();
            channels.sort();
            channels.dedup();
            channels
        };
        channels
            .into_iter()
            .map(|channel| self.unsubscribe_channel(channel))
            .sum()
    }

    pub fn is_active(&self, channel: ChannelKind, logical_key: &str) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .contains_key(&SubscriptionKey::new(channel, logical_key))
    }

    /// Logical keys active on `channel`, sorted.
    pub fn active_keys(&self, channel: ChannelKind) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .state
            .lock()
            .entries
            .keys()
            .filter(|key| key.channel == channel)
            .map(|key| key.logical_key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn attach(&self, state: &mut RegistryState, connection: &ConnectionHandle) {
        let channel = connection.channel();
        if let Some(existing) = state.attachments.get(&channel) {
            if existing.connection.id() == connection.id() {
                return;
            }
            existing.connection.detach_listener(existing.listener);
            for entry in state
                .entries
                .iter_mut()
                .filter(|(key, _)| key.channel == channel)
                .map(|(_, entry)| entry)
            {
                entry.binding = None;
            }
        }
        let listener = connection.register_listener(Arc::new(RegistryListener {
            channel,
            registry: Arc::downgrade(&self.inner),
        }));
        state.attachments.insert(
            channel,
            Attachment {
                connection: connection.clone(),
                listener,
            },
        );
    }
}

impl RegistryInner {
    fn replay(&self, channel: ChannelKind, session: &Arc<dyn TransportSession>) {
        let mut state = self.state.lock();
        let mut replayed = 0usize;
        for (key, entry) in state
            .entries
            .iter_mut()
            .filter(|(key, _)| key.channel == channel)
        {
            let current = entry
                .binding
                .as_ref()
                .is_some_and(|binding| binding.session_id == session.id());
            if !current && bind(key, entry, session) {
                replayed += 1;
            }
        }
        info!(
            target: "realtime.subscription",
            channel = %channel,
            session_id = session.id(),
            replayed,
            "subscriptions replayed"
        );
    }
}

fn bind(key: &SubscriptionKey, entry: &mut Entry, session: &Arc<dyn TransportSession>) -> bool {
    match session.subscribe(&entry.destination) {
        Ok(subscription) => {
            entry.binding = Some(Binding {
                session_id: session.id(),
                subscription,
            });
            true
        }
        Err(err) => {
            entry.binding = None;
            warn!(
                target: "realtime.subscription",
                channel = %key.channel,
                key = %key.logical_key,
                destination = %entry.destination,
                error = %err,
                "subscribe failed; will retry on next connect"
            );
            false
        }
    }
}

fn release(key: &SubscriptionKey, entry: Entry, session: Option<&Arc<dyn TransportSession>>) {
    let (Some(binding), Some(session)) = (entry.binding, session) else {
        return;
    };
    if binding.session_id != session.id() {
        return;
    }
    if let Err(err) = session.unsubscribe(binding.subscription) {
        debug!(
            target: "realtime.subscription",
            channel = %key.channel,
            key = %key.logical_key,
            error = %err,
            "unsubscribe on closed session ignored"
        );
    }
}

struct RegistryListener {
    channel: ChannelKind,
    registry: Weak<RegistryInner>,
}

impl ConnectionListener for RegistryListener {
    fn on_connected(&self, session: &Arc<dyn TransportSession>, _reconnected: bool) {
        if let Some(registry) = self.registry.upgrade() {
            registry.replay(self.channel, session);
        }
    }

    fn on_frame(&self, frame: &Frame) {
        if let Some(registry) = self.registry.upgrade() {
            registry.dispatcher.route_frame(self.channel, frame);
        }
    }
}

/// Unsubscribes everything it created when dropped, for consumers whose
/// lifetime is shorter than the session.
pub struct SubscriptionScope {
    registry: SubscriptionRegistry,
    keys: Vec<SubscriptionKey>,
}

impl SubscriptionScope {
    pub fn new(registry: SubscriptionRegistry) -> Self {
        Self {
            registry,
            keys: Vec::new(),
        }
    }

    pub fn subscribe<D, H>(
        &mut self,
        connection: &ConnectionHandle,
        logical_key: impl Into<String>,
        destination: D,
        handler: H,
    ) -> bool
    where
        D: FnOnce(&str) -> String,
        H: PushHandler + 'static,
    {
        let key = SubscriptionKey::new(connection.channel(), logical_key);
        let created = self
            .registry
            .subscribe(connection, key.logical_key.clone(), destination, handler);
        if created {
            self.keys.push(key);
        }
        created
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for SubscriptionScope {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            self.registry.unsubscribe(key.channel, &key.logical_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::{ChannelConfig, ConnectionManager, ConnectionState};
    use feed_proto::PushEvent;
    use push_transport::LocalBroker;

    fn config(channel: ChannelKind) -> ChannelConfig {
        ChannelConfig {
            channel,
            endpoint: "local://push".into(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: None,
            heartbeat_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    async fn connected(manager: &ConnectionManager, channel: ChannelKind) -> ConnectionHandle {
        let handle = manager.connect(config(channel));
        handle
            .watch_state()
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("state");
        handle
    }

    fn chat_frame(id: &str) -> String {
        format!(
            r#"{{"id":"{id}","senderId":1,"recipientId":2,"content":"hi","timestamp":"2024-05-01T10:00:00"}}"#
        )
    }

    fn counter() -> (Arc<Mutex<Vec<String>>>, impl Fn(PushEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: PushEvent| sink.lock().push(event.id()))
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_is_a_no_op() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let handle = connected(&manager, ChannelKind::Chat).await;
        let registry = SubscriptionRegistry::new();

        let (seen, handler) = counter();
        assert!(registry.subscribe(&handle, "1-2", |key| format!("/topic/chat/{key}"), handler));
        let (_, again) = counter();
        assert!(!registry.subscribe(&handle, "1-2", |key| format!("/topic/chat/{key}"), again));
        assert_eq!(broker.subscriptions(), vec!["/topic/chat/1-2".to_string()]);

        assert_eq!(broker.push("/topic/chat/1-2", chat_frame("m1")), 1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock(), vec!["m1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_made_offline_bind_on_connect() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let handle = manager.connect(config(ChannelKind::Chat));
        let registry = SubscriptionRegistry::new();
        let (_, handler) = counter();
        registry.subscribe(&handle, "1-2", |key| format!("/topic/chat/{key}"), handler);
        assert!(broker.subscriptions().is_empty());

        handle
            .watch_state()
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("state");
        assert_eq!(broker.subscriptions(), vec!["/topic/chat/1-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn replays_after_reconnect_without_duplicates() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let handle = connected(&manager, ChannelKind::Chat).await;
        let registry = SubscriptionRegistry::new();
        let (seen, handler) = counter();
        registry.subscribe(&handle, "1-2", |key| format!("/topic/chat/{key}"), handler);
        let (_, other) = counter();
        registry.subscribe(&handle, "1-3", |key| format!("/topic/chat/{key}"), other);

        broker.drop_sessions("restart");
        let mut state = handle.watch_state();
        state
            .wait_for(|state| *state == ConnectionState::Reconnecting)
            .await
            .expect("state");
        assert!(broker.subscriptions().is_empty());
        state
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("state");

        assert_eq!(
            broker.subscriptions(),
            vec!["/topic/chat/1-2".to_string(), "/topic/chat/1-3".to_string()]
        );
        assert_eq!(broker.push("/topic/chat/1-2", chat_frame("m2")), 1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock(), vec!["m2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_releases_transport_subscription() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let handle = connected(&manager, ChannelKind::Notifications).await;
        let registry = SubscriptionRegistry::new();
        let (_, handler) = counter();
        registry.subscribe(&handle, "7", |key| format!("/topic/notifications/{key}"), handler);
        assert!(registry.is_active(ChannelKind::Notifications, "7"));

        assert!(registry.unsubscribe(ChannelKind::Notifications, "7"));
        assert!(!registry.unsubscribe(ChannelKind::Notifications, "7"));
        assert!(broker.subscriptions().is_empty());
        assert_eq!(registry.dispatcher().route_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_drop_cleans_up_and_channel_teardown_detaches() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let handle = connected(&manager, ChannelKind::Chat).await;
        let registry = SubscriptionRegistry::new();

        let (_, session_wide) = counter();
        registry.subscribe(&handle, "1-9", |key| format!("/topic/chat/{key}"), session_wide);
        {
            let mut scope = SubscriptionScope::new(registry.clone());
            let (_, a) = counter();
            let (_, b) = counter();
            scope.subscribe(&handle, "1-2", |key| format!("/topic/chat/{key}"), a);
            scope.subscribe(&handle, "1-3", |key| format!("/topic/chat/{key}"), b);
            assert_eq!(scope.len(), 2);
            assert_eq!(registry.active_keys(ChannelKind::Chat).len(), 3);
        }
        assert_eq!(registry.active_keys(ChannelKind::Chat), vec!["1-9".to_string()]);
        assert_eq!(broker.subscriptions(), vec!["/topic/chat/1-9".to_string()]);

        assert_eq!(registry.unsubscribe_all(), 1);
        assert!(broker.subscriptions().is_empty());

        // A detached registry no longer replays on reconnect.
        broker.drop_sessions("restart");
        let mut state = handle.watch_state();
        state
            .wait_for(|state| *state == ConnectionState::Reconnecting)
            .await
            .expect("state");
        state
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("state");
        assert!(broker.subscriptions().is_empty());
    }
}
