//! Login-scoped container of the realtime core.
//!
//! A [`RealtimeSession`] is built when a user logs in and shut down at
//! logout. It owns the channel connections, the subscription registry, the
//! notification feed, open chat conversations and the upvote store, and
//! wires reconnects to resyncs so a gap in push delivery is filled from REST.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use feed_api::{ChatApi, NotificationApi, UpvoteApi};
use feed_proto::destination::{chat_topic, notification_topic};
use feed_proto::{ConversationKey, PushEvent, UserId};
use parking_lot::Mutex;
use push_transport::{PushTransport, TransportSession};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::ChatConversation;
use crate::config::RealtimeConfig;
use crate::connection::{
    ChannelKind, ConnectionListener, ConnectionManager, ConnectionState, ListenerId,
};
use crate::error::{MutationError, RealtimeError, RealtimeResult};
use crate::notifications::NotificationFeed;
use crate::subscription::SubscriptionRegistry;
use crate::upvote::UpvoteController;

const EVENT_BUFFER: usize = 64;

/// REST collaborators of a session.
#[derive(Clone)]
pub struct SessionApis {
    pub notifications: Arc<dyn NotificationApi>,
    pub chat: Arc<dyn ChatApi>,
    pub upvotes: Arc<dyn UpvoteApi>,
}

impl SessionApis {
    /// Uses one backend for every endpoint group.
    pub fn from_backend<A>(backend: Arc<A>) -> Self
    where
        A: NotificationApi + ChatApi + UpvoteApi + 'static,
    {
        Self {
            notifications: backend.clone(),
            chat: backend.clone(),
            upvotes: backend,
        }
    }
}

/// Signals for the session-management layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The backend rejected the session's credentials. The affected channel
    /// has stopped reconnecting.
    AuthExpired { reason: String },
    /// An optimistic mutation was rolled back.
    MutationFailed(MutationError),
}

struct SessionInner {
    user_id: UserId,
    config: RealtimeConfig,
    connections: ConnectionManager,
    registry: SubscriptionRegistry,
    notifications: NotificationFeed,
    upvotes: UpvoteController,
    chat_api: Arc<dyn ChatApi>,
    chats: Mutex<HashMap<ConversationKey, ChatConversation>>,
    /// Connection the chat listener is registered on, and its id there.
    chat_listener: Mutex<Option<(Uuid, ListenerId)>>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        debug!(target: "realtime.session", event = ?event, "session event");
        let _ = self.events.send(event);
    }

    fn report(&self, err: &RealtimeError) {
        if err.is_auth() {
            self.emit(SessionEvent::AuthExpired {
                reason: err.to_string(),
            });
        }
    }

    fn ensure_open(&self, channel: ChannelKind) -> RealtimeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RealtimeError::NotConnected(channel));
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

/// Reacts to connection lifecycle on behalf of the session: reconnects
/// trigger a catch-up, auth failures are surfaced.
struct SessionListener {
    channel: ChannelKind,
    session: Weak<SessionInner>,
}

impl ConnectionListener for SessionListener {
    fn on_connected(&self, _transport: &Arc<dyn TransportSession>, reconnected: bool) {
        if !reconnected {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        info!(
            target: "realtime.session",
            channel = %self.channel,
            "channel reconnected; catching up"
        );
        match self.channel {
            ChannelKind::Notifications => {
                let weak = Arc::downgrade(&session);
                let feed = session.notifications.clone();
                session.track(tokio::spawn(async move {
                    if let Err(err) = feed.resync().await {
                        warn!(
                            target: "realtime.session",
                            error = %err,
                            "resync after reconnect failed"
                        );
                        if let Some(session) = weak.upgrade() {
                            session.report(&err);
                        }
                    }
                }));
            }
            ChannelKind::Chat => {
                let chats: Vec<ChatConversation> = session.chats.lock().values().cloned().collect();
                let weak = Arc::downgrade(&session);
                session.track(tokio::spawn(async move {
                    for chat in chats {
                        if let Err(err) = chat.catch_up().await {
                            warn!(
                                target: "realtime.session",
                                conversation = %chat.key(),
                                error = %err,
                                "chat catch-up failed"
                            );
                            if let Some(session) = weak.upgrade() {
                                session.report(&err);
                            }
                        }
                    }
                }));
            }
        }
    }

    fn on_error(&self, error: &RealtimeError) {
        if let Some(session) = self.session.upgrade() {
            session.report(error);
        }
    }
}

/// Realtime core of one logged-in user. Shut down on drop.
pub struct RealtimeSession {
    inner: Arc<SessionInner>,
}

impl RealtimeSession {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        user_id: UserId,
        config: RealtimeConfig,
        transport: Arc<dyn PushTransport>,
        apis: SessionApis,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let notifications = NotificationFeed::new(
            user_id,
            apis.notifications,
            config.notification_page_size,
        );
        let upvotes = UpvoteController::new(user_id, apis.upvotes);
        let inner = Arc::new(SessionInner {
            user_id,
            config,
            connections: ConnectionManager::new(transport),
            registry: SubscriptionRegistry::new(),
            notifications,
            upvotes,
            chat_api: apis.chat,
            chats: Mutex::new(HashMap::new()),
            chat_listener: Mutex::new(None),
            events,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut failures = inner.upvotes.subscribe_failures();
        let weak = Arc::downgrade(&inner);
        inner.track(tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(failure) => {
                        let Some(session) = weak.upgrade() else {
                            return;
                        };
                        if failure.unauthorized {
                            session.emit(SessionEvent::AuthExpired {
                                reason: failure.reason.clone(),
                            });
                        }
                        session.emit(SessionEvent::MutationFailed(failure));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "realtime.session",
                            skipped,
                            "mutation failures dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        info!(target: "realtime.session", user_id, "session started");
        Self { inner }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn notifications(&self) -> &NotificationFeed {
        &self.inner.notifications
    }

    pub fn upvotes(&self) -> &UpvoteController {
        &self.inner.upvotes
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self, channel: ChannelKind) -> ConnectionState {
        self.inner
            .connections
            .handle(channel)
            .map(|handle| handle.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Connects the notification channel, subscribes to the user's topic and
    /// loads the first page. Calling it again only reloads.
    pub async fn open_notifications(&self) -> RealtimeResult<NotificationFeed> {
        let inner = &self.inner;
        inner.ensure_open(ChannelKind::Notifications)?;
        let logical_key = inner.user_id.to_string();

        if !inner.registry.is_active(ChannelKind::Notifications, &logical_key) {
            let handle = inner
                .connections
                .connect(inner.config.channel(ChannelKind::Notifications));
            handle.register_listener(Arc::new(SessionListener {
                channel: ChannelKind::Notifications,
                session: Arc::downgrade(inner),
            }));
            let feed = inner.notifications.clone();
            let user_id = inner.user_id;
            inner.registry.subscribe(
                &handle,
                logical_key,
                |_| notification_topic(user_id),
                move |event: PushEvent| {
                    if let PushEvent::Notification(record) = event {
                        feed.on_push(record);
                    }
                },
            );
            if let Some(every) = inner.config.resync_interval() {
                inner.track(spawn_periodic_resync(Arc::downgrade(inner), every));
            }
        }

        if let Err(err) = inner.notifications.load_initial().await {
            inner.report(&err);
            return Err(err);
        }
        Ok(inner.notifications.clone())
    }

    /// Opens (or returns) the conversation with `buddy_id`. The chat channel
    /// is connected on the first open conversation. A failed history load
    /// leaves the conversation open and subscribed.
    pub async fn open_chat(&self, buddy_id: UserId) -> RealtimeResult<ChatConversation> {
        let inner = &self.inner;
        inner.ensure_open(ChannelKind::Chat)?;
        let key = ConversationKey::new(inner.user_id, buddy_id);
        if let Some(existing) = inner.chats.lock().get(&key).cloned() {
            return Ok(existing);
        }

        let conversation = ChatConversation::new(
            inner.user_id,
            buddy_id,
            Arc::clone(&inner.chat_api),
            inner.config.chat_history_limit,
        );
        let handle = inner
            .connections
            .connect(inner.config.channel(ChannelKind::Chat));
        {
            // A terminated connection is replaced by a fresh one that has
            // no listener yet.
            let mut listener = inner.chat_listener.lock();
            if listener.map_or(true, |(connection, _)| connection != handle.id()) {
                let id = handle.register_listener(Arc::new(SessionListener {
                    channel: ChannelKind::Chat,
                    session: Arc::downgrade(inner),
                }));
                *listener = Some((handle.id(), id));
            }
        }
        inner.chats.lock().insert(key, conversation.clone());

        let target = conversation.clone();
        inner.registry.subscribe(
            &handle,
            key.to_string(),
            |_| chat_topic(key),
            move |event: PushEvent| {
                if let PushEvent::ChatMessage(message) = event {
                    target.on_push(message);
                }
            },
        );

        if let Err(err) = conversation.load_initial().await {
            inner.report(&err);
            return Err(err);
        }
        Ok(conversation)
    }

    pub fn chat(&self, buddy_id: UserId) -> Option<ChatConversation> {
        let key = ConversationKey::new(self.inner.user_id, buddy_id);
        self.inner.chats.lock().get(&key).cloned()
    }

    /// Closes one conversation. The chat channel is disconnected once no
    /// conversation remains open.
    pub fn close_chat(&self, buddy_id: UserId) -> bool {
        let inner = &self.inner;
        let key = ConversationKey::new(inner.user_id, buddy_id);
        let remaining = {
            let mut chats = inner.chats.lock();
            if chats.remove(&key).is_none() {
                return false;
            }
            chats.len()
        };
        inner.registry.unsubscribe(ChannelKind::Chat, &key.to_string());
        if remaining == 0 {
            inner.registry.unsubscribe_channel(ChannelKind::Chat);
            inner.chat_listener.lock().take();
            if let Some(handle) = inner.connections.handle(ChannelKind::Chat) {
                inner.connections.disconnect(&handle);
            }
            debug!(target: "realtime.session", "last conversation closed");
        }
        true
    }

    /// Publishes `content` to the buddy over the push channel.
    pub fn publish_chat(&self, buddy_id: UserId, content: &str) -> RealtimeResult<()> {
        let conversation = self
            .chat(buddy_id)
            .ok_or(RealtimeError::NotConnected(ChannelKind::Chat))?;
        let handle = self
            .inner
            .connections
            .handle(ChannelKind::Chat)
            .ok_or(RealtimeError::NotConnected(ChannelKind::Chat))?;
        let (destination, body) = conversation.outgoing(content)?;
        handle.publish(&destination, body)
    }

    /// Logout: drops every subscription, disconnects every channel and stops
    /// background work. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        let removed = inner.registry.unsubscribe_all();
        inner.chats.lock().clear();
        inner.chat_listener.lock().take();
        inner.connections.disconnect_all();
        info!(
            target: "realtime.session",
            user_id = inner.user_id,
            subscriptions = removed,
            "session shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_periodic_resync(
    session: Weak<SessionInner>,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = session.upgrade() else {
                return;
            };
            let feed = inner.notifications.clone();
            drop(inner);
            if let Err(err) = feed.resync().await {
                warn!(
                    target: "realtime.session",
                    error = %err,
                    "periodic resync failed"
                );
                if let Some(inner) = session.upgrade() {
                    inner.report(&err);
                }
            }
        }
    })
}
