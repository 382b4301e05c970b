//! Shared data model for the social feed client: push payloads, REST
//! records, page envelopes and push destinations. Kept free of runtime code
//! so REST and push layers can share it.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub mod destination;
mod wire;

pub use destination::ConversationKey;

pub type UserId = i64;
pub type NotificationId = i64;
pub type MessageId = String;
pub type TopicId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    MessageRequest,
    Upvote,
    Opinion,
    #[serde(other)]
    Others,
}

/// Read state of a notification. Ordered by progression: a record never
/// moves back from `Read` to `Unread` through a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Unread,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub message: String,
    pub status: NotificationStatus,
    #[serde(with = "wire::timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<i64>,
}

impl NotificationRecord {
    pub fn is_unread(&self) -> bool {
        self.status == NotificationStatus::Unread
    }
}

/// Delivery state of a chat message, ordered by progression.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(with = "wire::string_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    #[serde(with = "wire::timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub status: ChatStatus,
}

impl ChatMessage {
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.recipient_id)
    }
}

/// Body of an outgoing chat message, both for the REST send endpoint and for
/// publishing on the chat application destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChatMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub message: String,
}

/// Typed push payload, decided from the destination a frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    Notification(NotificationRecord),
    ChatMessage(ChatMessage),
}

impl PushEvent {
    pub fn id(&self) -> String {
        match self {
            PushEvent::Notification(record) => record.id.to_string(),
            PushEvent::ChatMessage(message) => message.id.clone(),
        }
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        match self {
            PushEvent::Notification(record) => record.timestamp,
            PushEvent::ChatMessage(message) => message.timestamp,
        }
    }
}

/// Position a page was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Zero-based page index (notifications).
    Page(u32),
    /// Items strictly older than this message (chat history). `None` fetches
    /// the most recent window.
    Before(Option<MessageId>),
}

/// One REST page, consumed once by a reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage<T> {
    pub cursor: PageCursor,
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> FeedPage<T> {
    /// A full page means the server may hold more.
    pub fn from_fetch(cursor: PageCursor, items: Vec<T>, page_size: usize) -> Self {
        let has_more = page_size > 0 && items.len() == page_size;
        Self {
            cursor,
            items,
            has_more,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteState {
    pub count: i64,
    pub user_has_upvoted: bool,
}

impl UpvoteState {
    pub fn toggled(&self) -> Self {
        if self.user_has_upvoted {
            Self {
                count: self.count - 1,
                user_has_upvoted: false,
            }
        } else {
            Self {
                count: self.count + 1,
                user_has_upvoted: true,
            }
        }
    }
}
