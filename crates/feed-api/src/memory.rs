use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use feed_proto::{
    ChatMessage, ChatStatus, ConversationKey, NotificationId, NotificationRecord,
    NotificationStatus, TopicId, UserId,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{ApiError, ApiResult, ChatApi, NotificationApi, UpvoteApi};

/// Operations of the REST boundary, used to script failures and holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOp {
    FetchNotifications,
    UnreadCount,
    MarkRead,
    MarkAllRead,
    RespondToRequest,
    FetchHistory,
    SendMessage,
    AddUpvote,
    RemoveUpvote,
    UpvoteCount,
    HasUpvoted,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Unavailable,
    Unauthorized,
}

/// Keeps one scripted call waiting until released (or dropped).
pub struct HeldCall {
    open: watch::Sender<bool>,
}

impl HeldCall {
    pub fn release(&self) {
        let _ = self.open.send(true);
    }
}

/// In-memory REST backend for tests and early wiring.
#[derive(Default)]
pub struct InMemoryFeedApi {
    state: Mutex<BackendState>,
}

#[derive(Default)]
struct BackendState {
    notifications: Vec<NotificationRecord>,
    messages: HashMap<ConversationKey, Vec<ChatMessage>>,
    next_message: u64,
    upvoters: HashMap<TopicId, HashSet<UserId>>,
    base_counts: HashMap<TopicId, i64>,
    failures: HashMap<ApiOp, VecDeque<Failure>>,
    holds: HashMap<ApiOp, VecDeque<watch::Receiver<bool>>>,
    calls: HashMap<ApiOp, usize>,
}

impl InMemoryFeedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_notification(&self, record: NotificationRecord) {
        let mut state = self.state.lock();
        state.notifications.retain(|existing| existing.id != record.id);
        state.notifications.push(record);
    }

    pub fn notification(&self, id: NotificationId) -> Option<NotificationRecord> {
        self.state
            .lock()
            .notifications
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub fn insert_message(&self, message: ChatMessage) {
        let mut state = self.state.lock();
        let thread = state.messages.entry(message.conversation()).or_default();
        thread.retain(|existing| existing.id != message.id);
        thread.push(message);
        thread.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    /// Seeds a topic with upvotes from users other than the ones exercised
    /// through the API.
    pub fn set_base_upvotes(&self, topic_id: &str, count: i64) {
        self.state
            .lock()
            .base_counts
            .insert(topic_id.to_string(), count);
    }

    pub fn has_upvote(&self, user_id: UserId, topic_id: &str) -> bool {
        self.state
            .lock()
            .upvoters
            .get(topic_id)
            .map(|users| users.contains(&user_id))
            .unwrap_or(false)
    }

    /// The next call of `op` fails as if the service were unreachable.
    pub fn fail_next(&self, op: ApiOp) {
        self.push_failure(op, Failure::Unavailable);
    }

    /// The next call of `op` fails as unauthorized.
    pub fn reject_next(&self, op: ApiOp) {
        self.push_failure(op, Failure::Unauthorized);
    }

    /// The next call of `op` waits until the returned handle is released.
    pub fn hold_next(&self, op: ApiOp) -> HeldCall {
        let (open, rx) = watch::channel(false);
        self.state.lock().holds.entry(op).or_default().push_back(rx);
        HeldCall { open }
    }

    pub fn calls(&self, op: ApiOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn push_failure(&self, op: ApiOp, failure: Failure) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Holds and failures are claimed when the call starts, so overlapping
    /// calls of the same operation get them in call order.
    async fn enter(&self, op: ApiOp) -> ApiResult<()> {
        let (hold, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            let hold = state.holds.get_mut(&op).and_then(VecDeque::pop_front);
            let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (hold, failure)
        };
        if let Some(mut gate) = hold {
            let _ = gate.wait_for(|open| *open).await;
        }
        match failure {
            Some(Failure::Unavailable) => Err(ApiError::Unavailable(format!("{op:?} failed"))),
            Some(Failure::Unauthorized) => Err(ApiError::Unauthorized {
                body: "session expired".into(),
            }),
            None => Ok(()),
        }
    }
}

fn newest_first(records: &mut [NotificationRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl NotificationApi for InMemoryFeedApi {
    async fn fetch_notifications(
        &self,
        user_id: UserId,
        page: u32,
        size: u32,
    ) -> ApiResult<Vec<NotificationRecord>> {
        self.enter(ApiOp::FetchNotifications).await?;
        let state = self.state.lock();
        let mut records: Vec<NotificationRecord> = state
            .notifications
            .iter()
            .filter(|record| record.recipient_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut records);
        let start = (page as usize).saturating_mul(size as usize);
        Ok(records
            .into_iter()
            .skip(start)
            .take(size as usize)
            .collect())
    }

    async fn unread_count(&self, user_id: UserId) -> ApiResult<u64> {
        self.enter(ApiOp::UnreadCount).await?;
        let state = self.state.lock();
        Ok(state
            .notifications
            .iter()
            .filter(|record| record.recipient_id == user_id && record.is_unread())
            .count() as u64)
    }

    async fn mark_read(&self, id: NotificationId) -> ApiResult<()> {
        self.enter(ApiOp::MarkRead).await?;
        let mut state = self.state.lock();
        if let Some(record) = state.notifications.iter_mut().find(|r| r.id == id) {
            record.status = NotificationStatus::Read;
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: UserId) -> ApiResult<()> {
        self.enter(ApiOp::MarkAllRead).await?;
        let mut state = self.state.lock();
        for record in state
            .notifications
            .iter_mut()
            .filter(|record| record.recipient_id == user_id)
        {
            record.status = NotificationStatus::Read;
        }
        Ok(())
    }

    async fn respond_to_request(
        &self,
        id: NotificationId,
        _accept: bool,
        _sender_id: UserId,
        _recipient_id: UserId,
    ) -> ApiResult<()> {
        self.enter(ApiOp::RespondToRequest).await?;
        self.state.lock().notifications.retain(|record| record.id != id);
        Ok(())
    }
}

#[async_trait]
impl ChatApi for InMemoryFeedApi {
    async fn fetch_history(
        &self,
        user_id: UserId,
        buddy_id: UserId,
        last_message_id: Option<&str>,
        limit: u32,
    ) -> ApiResult<Vec<ChatMessage>> {
        self.enter(ApiOp::FetchHistory).await?;
        let state = self.state.lock();
        let Some(thread) = state.messages.get(&ConversationKey::new(user_id, buddy_id)) else {
            return Ok(Vec::new());
        };
        let end = match last_message_id {
            Some(last) => thread
                .iter()
                .position(|message| message.id == last)
                .unwrap_or(0),
            None => thread.len(),
        };
        let start = end.saturating_sub(limit as usize);
        Ok(thread[start..end].to_vec())
    }

    async fn send_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        content: &str,
    ) -> ApiResult<ChatMessage> {
        self.enter(ApiOp::SendMessage).await?;
        let mut state = self.state.lock();
        state.next_message += 1;
        let key = ConversationKey::new(sender_id, recipient_id);
        let latest = state
            .messages
            .get(&key)
            .and_then(|thread| thread.last())
            .map(|message| message.timestamp);
        let now = Utc::now().naive_utc();
        let timestamp: NaiveDateTime = match latest {
            Some(latest) if latest >= now => latest + Duration::milliseconds(1),
            _ => now,
        };
        let message = ChatMessage {
            id: format!("srv-{}", state.next_message),
            sender_id,
            recipient_id,
            content: content.to_string(),
            timestamp,
            status: ChatStatus::Sent,
        };
        state.messages.entry(key).or_default().push(message.clone());
        Ok(message)
    }
}

#[async_trait]
impl UpvoteApi for InMemoryFeedApi {
    async fn add_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        self.enter(ApiOp::AddUpvote).await?;
        self.state
            .lock()
            .upvoters
            .entry(topic_id.clone())
            .or_default()
            .insert(user_id);
        Ok(())
    }

    async fn remove_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        self.enter(ApiOp::RemoveUpvote).await?;
        if let Some(users) = self.state.lock().upvoters.get_mut(topic_id) {
            users.remove(&user_id);
        }
        Ok(())
    }

    async fn upvote_count(&self, topic_id: &TopicId) -> ApiResult<i64> {
        self.enter(ApiOp::UpvoteCount).await?;
        let state = self.state.lock();
        let base = state.base_counts.get(topic_id).copied().unwrap_or(0);
        let voters = state
            .upvoters
            .get(topic_id)
            .map(|users| users.len() as i64)
            .unwrap_or(0);
        Ok(base + voters)
    }

    async fn has_upvoted(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<bool> {
        self.enter(ApiOp::HasUpvoted).await?;
        Ok(self.has_upvote(user_id, topic_id))
    }
}
