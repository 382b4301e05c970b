use feed_api::ApiError;
use feed_proto::NotificationId;
use push_transport::TransportError;
use thiserror::Error;

use crate::connection::ChannelKind;

/// A frame that could not be turned into a typed push event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no push event is published on {0}")]
    UnknownDestination(String),
    #[error("malformed payload on {destination}: {source}")]
    Malformed {
        destination: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of an optimistic mutation's network request. Observers receive it
/// after the entity has been rolled back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("mutation on {entity} failed: {reason}")]
pub struct MutationError {
    pub entity: String,
    pub reason: String,
    pub unauthorized: bool,
}

impl MutationError {
    pub(crate) fn from_api(entity: String, err: &ApiError) -> Self {
        Self {
            entity,
            reason: err.to_string(),
            unauthorized: err.is_unauthorized(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Transient transport failure; the connection retries on its own.
    #[error("{channel} connection error: {reason}")]
    Connection { channel: ChannelKind, reason: String },
    #[error(transparent)]
    Protocol(#[from] DecodeError),
    /// Unauthorized-class failure, left to session management.
    #[error("{channel} connection unauthorized: {reason}")]
    Auth { channel: ChannelKind, reason: String },
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("{0} channel is not connected")]
    NotConnected(ChannelKind),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to encode outgoing payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("notification {0} is not in the feed")]
    UnknownNotification(NotificationId),
}

impl RealtimeError {
    pub(crate) fn from_transport(channel: ChannelKind, err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(reason) => RealtimeError::Auth { channel, reason },
            TransportError::Closed => RealtimeError::NotConnected(channel),
            TransportError::Transport(reason) => RealtimeError::Connection { channel, reason },
        }
    }

    /// True for every unauthorized-class failure, whichever layer raised it.
    pub fn is_auth(&self) -> bool {
        match self {
            RealtimeError::Auth { .. } => true,
            RealtimeError::Api(err) => err.is_unauthorized(),
            RealtimeError::Mutation(err) => err.unauthorized,
            _ => false,
        }
    }
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;
