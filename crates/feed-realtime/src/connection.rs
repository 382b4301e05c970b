//! Per-channel push connections.
//!
//! [`ConnectionManager`] keeps at most one live connection per
//! [`ChannelKind`]. Each connection is driven by a background task that opens
//! a transport session, exchanges heartbeats, watches for inbound silence,
//! and reconnects after a fixed delay whenever the session closes. Only
//! [`ConnectionManager::disconnect`] ends a connection for good (and an
//! unauthorized open, which is left to session management).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use push_transport::{Frame, OpenedSession, PushTransport, TransportEvent, TransportSession};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{RealtimeError, RealtimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Chat,
    Notifications,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Chat => f.write_str("chat"),
            ChannelKind::Notifications => f.write_str("notifications"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel: ChannelKind,
    pub endpoint: String,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Option<Duration>,
    /// Inbound silence tolerated before the session is treated as closed.
    pub heartbeat_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

/// Observer of one connection. Callbacks run on the connection task, one at
/// a time and in arrival order, and must not block.
pub trait ConnectionListener: Send + Sync {
    /// A session became live. `reconnected` is false only for the first
    /// session of the connection.
    fn on_connected(&self, _session: &Arc<dyn TransportSession>, _reconnected: bool) {}

    fn on_frame(&self, _frame: &Frame) {}

    fn on_error(&self, _error: &RealtimeError) {}
}

struct HandlerListener<M, E> {
    on_message: M,
    on_error: E,
}

impl<M, E> ConnectionListener for HandlerListener<M, E>
where
    M: Fn(&Frame) + Send + Sync,
    E: Fn(&RealtimeError) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        (self.on_message)(frame)
    }

    fn on_error(&self, error: &RealtimeError) {
        (self.on_error)(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Shared handle to one channel's connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: Uuid,
    config: ChannelConfig,
    state: watch::Sender<ConnectionState>,
    retry_count: AtomicU32,
    session: RwLock<Option<Arc<dyn TransportSession>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    next_listener: AtomicU64,
    shutdown: AtomicBool,
    terminated: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    fn new(config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            shared: Arc::new(ConnectionShared {
                id: Uuid::new_v4(),
                config,
                state,
                retry_count: AtomicU32::new(0),
                session: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn channel(&self) -> ChannelKind {
        self.shared.config.channel
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Consecutive failed or dropped sessions since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Session of the current `Connected` period, if any.
    pub fn current_session(&self) -> Option<Arc<dyn TransportSession>> {
        self.shared.session.read().clone()
    }

    /// True once the connection ended and will not reconnect.
    pub fn is_terminated(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst) || self.shared.terminated.load(Ordering::SeqCst)
    }

    pub fn register_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));
        self.shared.listeners.write().push((id, listener));
        id
    }

    pub fn detach_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn publish(&self, destination: &str, body: Bytes) -> RealtimeResult<()> {
        let channel = self.channel();
        if self.state() != ConnectionState::Connected {
            return Err(RealtimeError::NotConnected(channel));
        }
        let session = self
            .current_session()
            .ok_or(RealtimeError::NotConnected(channel))?;
        session
            .publish(destination, body)
            .map_err(|err| RealtimeError::from_transport(channel, err))
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(driver) = self.shared.driver.lock().take() {
            driver.abort();
        }
        if let Some(session) = self.shared.session.write().take() {
            session.close();
        }
        self.shared.listeners.write().clear();
        self.shared.set_state(ConnectionState::Disconnected);
        info!(
            target: "realtime.connection",
            channel = %self.channel(),
            connection_id = %self.id(),
            "connection closed by caller"
        );
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.config.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionShared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                target: "realtime.connection",
                channel = %self.config.channel,
                connection_id = %self.id,
                from = ?previous,
                to = ?next,
                "connection state changed"
            );
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn emit_error(&self, error: RealtimeError) {
        for listener in self.listeners() {
            listener.on_error(&error);
        }
    }
}

/// Owns the per-channel connections of one session.
pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    connections: Mutex<HashMap<ChannelKind, ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel's live connection, starting one if there is none.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, config: ChannelConfig) -> ConnectionHandle {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&config.channel) {
            if !existing.is_terminated() {
                return existing.clone();
            }
        }

        let handle = ConnectionHandle::new(config);
        info!(
            target: "realtime.connection",
            channel = %handle.channel(),
            connection_id = %handle.id(),
            endpoint = %handle.config().endpoint,
            "opening connection"
        );
        let driver = tokio::spawn(drive(
            Arc::clone(&handle.shared),
            Arc::clone(&self.transport),
        ));
        *handle.shared.driver.lock() = Some(driver);
        connections.insert(handle.channel(), handle.clone());
        handle
    }

    pub fn handle(&self, channel: ChannelKind) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .get(&channel)
            .filter(|handle| !handle.is_terminated())
            .cloned()
    }

    /// Registers message and error callbacks on a connection.
    pub fn register_handler<M, E>(
        &self,
        handle: &ConnectionHandle,
        on_message: M,
        on_error: E,
    ) -> ListenerId
    where
        M: Fn(&Frame) + Send + Sync + 'static,
        E: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        handle.register_listener(Arc::new(HandlerListener {
            on_message,
            on_error,
        }))
    }

    pub fn register_listener(
        &self,
        handle: &ConnectionHandle,
        listener: Arc<dyn ConnectionListener>,
    ) -> ListenerId {
        handle.register_listener(listener)
    }

    pub fn detach_handler(&self, handle: &ConnectionHandle, id: ListenerId) -> bool {
        handle.detach_listener(id)
    }

    pub fn publish(
        &self,
        handle: &ConnectionHandle,
        destination: &str,
        body: Bytes,
    ) -> RealtimeResult<()> {
        handle.publish(destination, body)
    }

    /// Ends the connection: closes the session, stops reconnecting and drops
    /// every listener.
    pub fn disconnect(&self, handle: &ConnectionHandle) {
        {
            let mut connections = self.connections.lock();
            if connections
                .get(&handle.channel())
                .is_some_and(|current| current.id() == handle.id())
            {
                connections.remove(&handle.channel());
            }
        }
        handle.shutdown();
    }

    pub fn disconnect_all(&self) {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.shutdown();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

async fn drive(shared: Arc<ConnectionShared>, transport: Arc<dyn PushTransport>) {
    let channel = shared.config.channel;
    let mut connected_before = false;

    loop {
        if shared.is_shutdown() {
            return;
        }
        shared.set_state(ConnectionState::Connecting);

        match timeout(
            shared.config.connect_timeout,
            transport.open(&shared.config.endpoint),
        )
        .await
        {
            Ok(Ok(opened)) => {
                if shared.is_shutdown() {
                    opened.session.close();
                    return;
                }
                shared.retry_count.store(0, Ordering::SeqCst);
                let reconnected = connected_before;
                connected_before = true;
                let reason = run_session(&shared, opened, reconnected).await;
                if shared.is_shutdown() {
                    return;
                }
                warn!(
                    target: "realtime.connection",
                    channel = %channel,
                    connection_id = %shared.id,
                    reason = %reason,
                    "session closed; scheduling reconnect"
                );
                shared.emit_error(RealtimeError::Connection { channel, reason });
            }
            Ok(Err(err)) if err.is_unauthorized() => {
                error!(
                    target: "realtime.connection",
                    channel = %channel,
                    connection_id = %shared.id,
                    error = %err,
                    "push endpoint rejected credentials; not retrying"
                );
                shared.terminated.store(true, Ordering::SeqCst);
                shared.set_state(ConnectionState::Disconnected);
                shared.emit_error(RealtimeError::from_transport(channel, err));
                return;
            }
            Ok(Err(err)) => {
                warn!(
                    target: "realtime.connection",
                    channel = %channel,
                    connection_id = %shared.id,
                    error = %err,
                    "connect attempt failed"
                );
                shared.emit_error(RealtimeError::from_transport(channel, err));
            }
            Err(_) => {
                warn!(
                    target: "realtime.connection",
                    channel = %channel,
                    connection_id = %shared.id,
                    timeout_ms = shared.config.connect_timeout.as_millis() as u64,
                    "connect attempt timed out"
                );
                shared.emit_error(RealtimeError::Connection {
                    channel,
                    reason: format!(
                        "connect timed out after {}ms",
                        shared.config.connect_timeout.as_millis()
                    ),
                });
            }
        }

        if shared.is_shutdown() {
            return;
        }
        let attempt = shared.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        shared.set_state(ConnectionState::Reconnecting);
        debug!(
            target: "realtime.connection",
            channel = %channel,
            connection_id = %shared.id,
            attempt,
            delay_ms = shared.config.reconnect_delay.as_millis() as u64,
            "waiting before reconnect"
        );
        sleep(shared.config.reconnect_delay).await;
    }
}

/// Runs one live session until it closes; returns the close reason.
async fn run_session(
    shared: &Arc<ConnectionShared>,
    opened: OpenedSession,
    reconnected: bool,
) -> String {
    let OpenedSession {
        session,
        mut events,
    } = opened;
    let channel = shared.config.channel;

    *shared.session.write() = Some(Arc::clone(&session));
    shared.set_state(ConnectionState::Connected);
    info!(
        target: "realtime.connection",
        channel = %channel,
        connection_id = %shared.id,
        session_id = session.id(),
        reconnected,
        "connected"
    );
    for listener in shared.listeners() {
        listener.on_connected(&session, reconnected);
    }

    let mut heartbeat = shared.config.heartbeat_outgoing.map(|every| {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let silence_limit = shared.config.heartbeat_timeout;
    let mut last_inbound = Instant::now();

    let reason = loop {
        let deadline = silence_limit.map(|limit| last_inbound + limit);
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Frame(frame)) => {
                    last_inbound = Instant::now();
                    trace!(
                        target: "realtime.connection",
                        channel = %channel,
                        destination = %frame.destination,
                        bytes = frame.body.len(),
                        "frame received"
                    );
                    for listener in shared.listeners() {
                        listener.on_frame(&frame);
                    }
                }
                Some(TransportEvent::Heartbeat) => {
                    last_inbound = Instant::now();
                    trace!(target: "realtime.connection", channel = %channel, "heartbeat received");
                }
                Some(TransportEvent::BrokerError(message)) => {
                    last_inbound = Instant::now();
                    warn!(
                        target: "realtime.connection",
                        channel = %channel,
                        error = %message,
                        "broker reported an error"
                    );
                    shared.emit_error(RealtimeError::Connection { channel, reason: message });
                }
                Some(TransportEvent::Closed { reason }) => break reason,
                None => break "transport event stream ended".to_string(),
            },
            _ = next_tick(&mut heartbeat) => {
                if let Err(err) = session.heartbeat() {
                    break format!("heartbeat send failed: {err}");
                }
                trace!(target: "realtime.connection", channel = %channel, "heartbeat sent");
            }
            _ = expire(deadline) => {
                break format!(
                    "no inbound traffic for {}ms",
                    silence_limit.map(|limit| limit.as_millis()).unwrap_or_default()
                );
            }
        }
    };

    shared.session.write().take();
    session.close();
    reason
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
