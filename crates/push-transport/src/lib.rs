//! Boundary of the publish/subscribe push transport.
//!
//! The realtime core never speaks a wire protocol itself; it drives a
//! [`PushTransport`] that opens sessions against the shared push endpoint.
//! Each opened session exposes destination subscriptions, publishing, and
//! heartbeats, and reports inbound traffic as a stream of [`TransportEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;

pub use local::LocalBroker;

/// Message delivered on (or published to) a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: String,
    pub body: Bytes,
}

impl Frame {
    pub fn new(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
        }
    }
}

/// Inbound traffic observed on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    Heartbeat,
    /// Error frame reported by the broker. The session stays open unless a
    /// `Closed` event follows.
    BrokerError(String),
    Closed { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-assigned id of one destination subscription within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One live session against the push endpoint.
///
/// Subscriptions belong to the session: once it closes they are gone and must
/// be issued again on the next session.
pub trait TransportSession: Send + Sync {
    fn id(&self) -> u64;
    fn subscribe(&self, destination: &str) -> TransportResult<SubscriptionId>;
    fn unsubscribe(&self, id: SubscriptionId) -> TransportResult<()>;
    fn publish(&self, destination: &str, body: Bytes) -> TransportResult<()>;
    fn heartbeat(&self) -> TransportResult<()>;
    fn close(&self);
}

pub struct OpenedSession {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, endpoint: &str) -> TransportResult<OpenedSession>;
}
