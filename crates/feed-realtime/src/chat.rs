use std::sync::Arc;

use bytes::Bytes;
use feed_api::ChatApi;
use feed_proto::destination::chat_publish;
use feed_proto::{ChatMessage, ConversationKey, FeedPage, OutgoingChatMessage, PageCursor, UserId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RealtimeResult;
use crate::reconcile::{FeedOrder, FeedReconciler, MergeOutcome};

/// Messages of one conversation, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatView {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
    pub loaded: bool,
}

struct ChatState {
    feed: FeedReconciler<ChatMessage>,
    loaded: bool,
}

struct ChatInner {
    user_id: UserId,
    buddy_id: UserId,
    key: ConversationKey,
    api: Arc<dyn ChatApi>,
    limit: u32,
    state: Mutex<ChatState>,
    view: watch::Sender<ChatView>,
}

impl ChatInner {
    fn publish(&self, state: &ChatState) {
        self.view.send_replace(ChatView {
            messages: state.feed.items().to_vec(),
            has_more: state.feed.has_more(),
            loaded: state.loaded,
        });
    }
}

/// Direct conversation between the session user and a buddy.
#[derive(Clone)]
pub struct ChatConversation {
    inner: Arc<ChatInner>,
}

impl ChatConversation {
    pub fn new(user_id: UserId, buddy_id: UserId, api: Arc<dyn ChatApi>, limit: u32) -> Self {
        let (view, _) = watch::channel(ChatView::default());
        Self {
            inner: Arc::new(ChatInner {
                user_id,
                buddy_id,
                key: ConversationKey::new(user_id, buddy_id),
                api,
                limit: limit.max(1),
                state: Mutex::new(ChatState {
                    feed: FeedReconciler::new(FeedOrder::Chronological),
                    loaded: false,
                }),
                view,
            }),
        }
    }

    pub fn key(&self) -> ConversationKey {
        self.inner.key
    }

    pub fn buddy_id(&self) -> UserId {
        self.inner.buddy_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.inner.view.subscribe()
    }

    pub fn snapshot(&self) -> ChatView {
        self.inner.view.borrow().clone()
    }

    /// Fetches the most recent window. Messages pushed before it returns are
    /// kept; the window is merged, not swapped in.
    pub async fn load_initial(&self) -> RealtimeResult<usize> {
        let inner = &self.inner;
        let messages = inner
            .api
            .fetch_history(inner.user_id, inner.buddy_id, None, inner.limit)
            .await?;
        let mut state = inner.state.lock();
        let merge = state.feed.merge_page(FeedPage::from_fetch(
            PageCursor::Before(None),
            messages,
            inner.limit as usize,
        ));
        state.loaded = true;
        inner.publish(&state);
        debug!(
            target: "realtime.feed",
            conversation = %inner.key,
            inserted = merge.inserted(),
            has_more = state.feed.has_more(),
            "chat history loaded"
        );
        Ok(merge.inserted())
    }

    /// Fills a gap after a reconnect: merges the most recent window without
    /// touching the paging state.
    pub async fn catch_up(&self) -> RealtimeResult<usize> {
        let inner = &self.inner;
        let messages = inner
            .api
            .fetch_history(inner.user_id, inner.buddy_id, None, inner.limit)
            .await?;
        let mut state = inner.state.lock();
        let mut inserted = 0;
        for message in messages {
            if matches!(state.feed.merge_live(message), MergeOutcome::Inserted) {
                inserted += 1;
            }
        }
        inner.publish(&state);
        debug!(
            target: "realtime.feed",
            conversation = %inner.key,
            inserted,
            "chat caught up"
        );
        Ok(inserted)
    }

    /// Prepends the page before the oldest held message. Returns how many
    /// messages were new.
    pub async fn load_older(&self) -> RealtimeResult<usize> {
        let inner = &self.inner;
        let cursor = {
            let state = inner.state.lock();
            if !state.loaded || !state.feed.has_more() {
                return Ok(0);
            }
            state.feed.oldest().map(|message| message.id.clone())
        };
        let messages = inner
            .api
            .fetch_history(inner.user_id, inner.buddy_id, cursor.as_deref(), inner.limit)
            .await?;
        let mut state = inner.state.lock();
        let merge = state.feed.merge_page(FeedPage::from_fetch(
            PageCursor::Before(cursor),
            messages,
            inner.limit as usize,
        ));
        inner.publish(&state);
        Ok(merge.inserted())
    }

    pub fn on_push(&self, message: ChatMessage) {
        let inner = &self.inner;
        if message.conversation() != inner.key {
            warn!(
                target: "realtime.feed",
                conversation = %inner.key,
                message_id = %message.id,
                "ignoring message from another conversation"
            );
            return;
        }
        let mut state = inner.state.lock();
        state.feed.merge_live(message);
        inner.publish(&state);
    }

    /// Sends through the REST endpoint and merges the stored message; its
    /// push echo is deduplicated by id.
    pub async fn send(&self, content: &str) -> RealtimeResult<ChatMessage> {
        let inner = &self.inner;
        let message = inner
            .api
            .send_message(inner.user_id, inner.buddy_id, content)
            .await?;
        let mut state = inner.state.lock();
        state.feed.merge_live(message.clone());
        inner.publish(&state);
        Ok(message)
    }

    /// Destination and body for publishing `content` over the push channel.
    pub fn outgoing(&self, content: &str) -> RealtimeResult<(String, Bytes)> {
        let inner = &self.inner;
        let body = serde_json::to_vec(&OutgoingChatMessage {
            sender_id: inner.user_id,
            recipient_id: inner.buddy_id,
            message: content.to_string(),
        })?;
        Ok((chat_publish(inner.user_id, inner.buddy_id), Bytes::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use feed_api::memory::{ApiOp, InMemoryFeedApi};
    use feed_proto::ChatStatus;

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, second))
            .expect("valid time")
    }

    fn message(id: &str, from: UserId, to: UserId, second: u32) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender_id: from,
            recipient_id: to,
            content: format!("body {id}"),
            timestamp: at(second),
            status: ChatStatus::Sent,
        }
    }

    fn seeded(count: u32) -> Arc<InMemoryFeedApi> {
        let api = InMemoryFeedApi::new();
        for i in 0..count {
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            api.insert_message(message(&format!("m{i:02}"), from, to, i));
        }
        api
    }

    fn ids(view: &ChatView) -> Vec<String> {
        view.messages.iter().map(|m| m.id.clone()).collect()
    }

    #[tokio::test]
    async fn history_pages_prepend_in_order() {
        let api = seeded(5);
        let chat = ChatConversation::new(1, 2, api.clone(), 2);
        assert_eq!(chat.load_initial().await.expect("load"), 2);
        assert_eq!(ids(&chat.snapshot()), vec!["m03", "m04"]);
        assert!(chat.snapshot().has_more);

        assert_eq!(chat.load_older().await.expect("older"), 2);
        assert_eq!(chat.load_older().await.expect("oldest"), 1);
        let view = chat.snapshot();
        assert_eq!(ids(&view), vec!["m00", "m01", "m02", "m03", "m04"]);
        assert!(!view.has_more);
        assert_eq!(chat.load_older().await.expect("exhausted"), 0);
        assert_eq!(api.calls(ApiOp::FetchHistory), 3);
    }

    #[tokio::test]
    async fn pushes_interleave_by_timestamp() {
        let api = seeded(4);
        let chat = ChatConversation::new(2, 1, api.clone(), 2);
        chat.on_push(message("late", 1, 2, 50));
        chat.load_initial().await.expect("load");
        chat.on_push(message("m03", 2, 1, 3));
        chat.load_older().await.expect("older");

        let view = chat.snapshot();
        assert_eq!(ids(&view), vec!["m00", "m01", "m02", "m03", "late"]);
        assert!(view
            .messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[tokio::test]
    async fn sent_message_is_not_duplicated_by_its_echo() {
        let api = seeded(0);
        let chat = ChatConversation::new(1, 2, api.clone(), 50);
        chat.load_initial().await.expect("load");
        let sent = chat.send("hello").await.expect("send");
        chat.on_push(sent.clone());
        let view = chat.snapshot();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn catch_up_fills_gaps_without_resetting_paging() {
        let api = seeded(4);
        let chat = ChatConversation::new(1, 2, api.clone(), 2);
        chat.load_initial().await.expect("load");
        api.insert_message(message("gap", 2, 1, 30));
        assert_eq!(chat.catch_up().await.expect("catch up"), 1);
        let view = chat.snapshot();
        assert_eq!(ids(&view), vec!["m02", "m03", "gap"]);
        assert!(view.has_more);
    }

    #[test]
    fn other_conversations_are_ignored() {
        let chat = ChatConversation::new(1, 2, InMemoryFeedApi::new(), 50);
        chat.on_push(message("x", 1, 3, 1));
        assert!(chat.snapshot().messages.is_empty());
        chat.on_push(message("y", 2, 1, 1));
        assert_eq!(chat.snapshot().messages.len(), 1);
    }

    #[test]
    fn outgoing_frame_targets_the_sender_first_destination() {
        let chat = ChatConversation::new(12, 3, InMemoryFeedApi::new(), 50);
        let (destination, body) = chat.outgoing("hey").expect("encode");
        assert_eq!(destination, "/app/chat/12-3");
        let decoded: OutgoingChatMessage = serde_json::from_slice(&body).expect("json");
        assert_eq!(decoded.sender_id, 12);
        assert_eq!(decoded.recipient_id, 3);
        assert_eq!(decoded.message, "hey");
    }
}
