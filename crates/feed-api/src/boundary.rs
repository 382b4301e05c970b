use async_trait::async_trait;
use feed_proto::{ChatMessage, NotificationId, NotificationRecord, TopicId, UserId};

use crate::{ApiResult, FeedApiClient};

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_notifications(
        &self,
        user_id: UserId,
        page: u32,
        size: u32,
    ) -> ApiResult<Vec<NotificationRecord>>;

    async fn unread_count(&self, user_id: UserId) -> ApiResult<u64>;

    async fn mark_read(&self, id: NotificationId) -> ApiResult<()>;

    async fn mark_all_read(&self, user_id: UserId) -> ApiResult<()>;

    /// Accepts or declines a message request.
    async fn respond_to_request(
        &self,
        id: NotificationId,
        accept: bool,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> ApiResult<()>;
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Up to `limit` messages older than `last_message_id` (or the most recent
    /// ones when absent), oldest first.
    async fn fetch_history(
        &self,
        user_id: UserId,
        buddy_id: UserId,
        last_message_id: Option<&str>,
        limit: u32,
    ) -> ApiResult<Vec<ChatMessage>>;

    async fn send_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        content: &str,
    ) -> ApiResult<ChatMessage>;
}

#[async_trait]
pub trait UpvoteApi: Send + Sync {
    async fn add_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()>;
    async fn remove_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()>;
    async fn upvote_count(&self, topic_id: &TopicId) -> ApiResult<i64>;
    async fn has_upvoted(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<bool>;
}

#[async_trait]
impl NotificationApi for FeedApiClient {
    async fn fetch_notifications(
        &self,
        user_id: UserId,
        page: u32,
        size: u32,
    ) -> ApiResult<Vec<NotificationRecord>> {
        FeedApiClient::fetch_notifications(self, user_id, page, size).await
    }

    async fn unread_count(&self, user_id: UserId) -> ApiResult<u64> {
        FeedApiClient::unread_count(self, user_id).await
    }

    async fn mark_read(&self, id: NotificationId) -> ApiResult<()> {
        FeedApiClient::mark_read(self, id).await
    }

    async fn mark_all_read(&self, user_id: UserId) -> ApiResult<()> {
        FeedApiClient::mark_all_read(self, user_id).await
    }

    async fn respond_to_request(
        &self,
        id: NotificationId,
        accept: bool,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> ApiResult<()> {
        FeedApiClient::respond_to_request(self, id, accept, sender_id, recipient_id).await
    }
}

#[async_trait]
impl ChatApi for FeedApiClient {
    async fn fetch_history(
        &self,
        user_id: UserId,
        buddy_id: UserId,
        last_message_id: Option<&str>,
        limit: u32,
    ) -> ApiResult<Vec<ChatMessage>> {
        FeedApiClient::fetch_history(self, user_id, buddy_id, last_message_id, limit).await
    }

    async fn send_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        content: &str,
    ) -> ApiResult<ChatMessage> {
        FeedApiClient::send_message(self, sender_id, recipient_id, content).await
    }
}

#[async_trait]
impl UpvoteApi for FeedApiClient {
    async fn add_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        FeedApiClient::add_upvote(self, user_id, topic_id).await
    }

    async fn remove_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        FeedApiClient::remove_upvote(self, user_id, topic_id).await
    }

    async fn upvote_count(&self, topic_id: &TopicId) -> ApiResult<i64> {
        FeedApiClient::upvote_count(self, topic_id).await
    }

    async fn has_upvoted(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<bool> {
        FeedApiClient::has_upvoted(self, user_id, topic_id).await
    }
}
