//! Push destinations shared with the server.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::UserId;

pub const NOTIFICATION_TOPIC_PREFIX: &str = "/topic/notifications/";
pub const CHAT_TOPIC_PREFIX: &str = "/topic/chat/";
pub const CHAT_PUBLISH_PREFIX: &str = "/app/chat/";

/// Canonical identity of a direct conversation: the two participants with
/// the lower id first, so both sides derive the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    pub fn includes(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

pub fn notification_topic(recipient: UserId) -> String {
    format!("{NOTIFICATION_TOPIC_PREFIX}{recipient}")
}

pub fn chat_topic(key: ConversationKey) -> String {
    format!("{CHAT_TOPIC_PREFIX}{key}")
}

/// Sender first: the server reads the author from the destination.
pub fn chat_publish(user: UserId, buddy: UserId) -> String {
    format!("{CHAT_PUBLISH_PREFIX}{user}-{buddy}")
}
