use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    Frame, OpenedSession, PushTransport, SubscriptionId, TransportError, TransportEvent,
    TransportResult, TransportSession,
};

/// Simple in-memory broker for tests and offline runs.
///
/// Pushes are delivered to every live session subscribed to the destination,
/// heartbeats from clients are echoed back, and failures can be scripted.
#[derive(Clone, Default)]
pub struct LocalBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    next_session: u64,
    next_subscription: u64,
    sessions: HashMap<u64, SessionSlot>,
    scripted_failures: VecDeque<TransportError>,
    stall_opens: bool,
    echo_heartbeats: bool,
    open_attempts: usize,
    heartbeats_received: usize,
    published: Vec<Frame>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            next_session: 1,
            next_subscription: 1,
            sessions: HashMap::new(),
            scripted_failures: VecDeque::new(),
            stall_opens: false,
            echo_heartbeats: true,
            open_attempts: 0,
            heartbeats_received: 0,
            published: Vec::new(),
        }
    }
}

struct SessionSlot {
    endpoint: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<SubscriptionId, String>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `open` call fails with `err`. Failures queue in call order.
    pub fn fail_next_open(&self, err: TransportError) {
        self.state.lock().scripted_failures.push_back(err);
    }

    /// While set, `open` never completes.
    pub fn stall_opens(&self, stall: bool) {
        self.state.lock().stall_opens = stall;
    }

    /// While unset, client heartbeats are accepted but never answered.
    pub fn echo_heartbeats(&self, echo: bool) {
        self.state.lock().echo_heartbeats = echo;
    }

    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn heartbeats_received(&self) -> usize {
        self.state.lock().heartbeats_received
    }

    /// Destinations currently subscribed across all live sessions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut destinations: Vec<String> = state
            .sessions
            .values()
            .flat_map(|slot| slot.subscriptions.values().cloned())
            .collect();
        destinations.sort();
        destinations
    }

    /// Frames clients published through their sessions, oldest first.
    pub fn published(&self) -> Vec<Frame> {
        self.state.lock().published.clone()
    }

    /// Server-side push. Returns how many subscriptions received the frame.
    pub fn push(&self, destination: &str, body: impl Into<Bytes>) -> usize {
        let frame = Frame::new(destination, body);
        let state = self.state.lock();
        let mut delivered = 0;
        for slot in state.sessions.values() {
            let matches = slot
                .subscriptions
                .values()
                .filter(|subscribed| subscribed.as_str() == destination)
                .count();
            for _ in 0..matches {
                if slot.events.send(TransportEvent::Frame(frame.clone())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn send_heartbeats(&self) {
        let state = self.state.lock();
        for slot in state.sessions.values() {
            let _ = slot.events.send(TransportEvent::Heartbeat);
        }
    }

    pub fn report_error(&self, message: &str) {
        let state = self.state.lock();
        for slot in state.sessions.values() {
            let _ = slot
                .events
                .send(TransportEvent::BrokerError(message.to_string()));
        }
    }

    /// Closes every live session from the server side, dropping their
    /// subscriptions.
    pub fn drop_sessions(&self, reason: &str) {
        let mut state = self.state.lock();
        for (id, slot) in state.sessions.drain() {
            debug!(
                target: "push.local",
                session = id,
                endpoint = %slot.endpoint,
                reason,
                "dropping session"
            );
            let _ = slot.events.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl PushTransport for LocalBroker {
    async fn open(&self, endpoint: &str) -> TransportResult<OpenedSession> {
        let stalled = {
            let mut state = self.state.lock();
            state.open_attempts += 1;
            if let Some(err) = state.scripted_failures.pop_front() {
                return Err(err);
            }
            state.stall_opens
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_session;
            state.next_session += 1;
            state.sessions.insert(
                id,
                SessionSlot {
                    endpoint: endpoint.to_string(),
                    events: tx,
                    subscriptions: HashMap::new(),
                },
            );
            id
        };
        Ok(OpenedSession {
            session: Arc::new(LocalSession {
                id,
                state: Arc::clone(&self.state),
            }),
            events: rx,
        })
    }
}

struct LocalSession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl TransportSession for LocalSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn subscribe(&self, destination: &str) -> TransportResult<SubscriptionId> {
        let mut state = self.state.lock();
        let sub_id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        let slot = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        slot.subscriptions.insert(sub_id, destination.to_string());
        Ok(sub_id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> TransportResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        slot.subscriptions.remove(&id);
        Ok(())
    }

    fn publish(&self, destination: &str, body: Bytes) -> TransportResult<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        state.published.push(Frame::new(destination, body));
        Ok(())
    }

    fn heartbeat(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.heartbeats_received += 1;
        let echo = state.echo_heartbeats;
        let slot = state.sessions.get(&self.id).ok_or(TransportError::Closed)?;
        if echo {
            let _ = slot.events.send(TransportEvent::Heartbeat);
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().sessions.remove(&self.id);
    }
}
