//! Asynchronous client for the social feed REST API.
//!
//! The realtime core consumes REST through the boundary traits in
//! [`boundary`]; [`FeedApiClient`] implements them over HTTP and
//! [`memory::InMemoryFeedApi`] implements them for tests and offline wiring.

use feed_proto::{
    ChatMessage, NotificationId, NotificationRecord, OutgoingChatMessage, TopicId, UserId,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod boundary;
pub mod memory;

pub use boundary::{ChatApi, NotificationApi, UpvoteApi};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Unauthorized-class failures are handed to session management instead
    /// of being retried.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct PageEnvelope<T> {
    content: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequestResponse {
    accept: bool,
    sender_id: UserId,
    recipient_id: UserId,
}

#[derive(Clone)]
pub struct FeedApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl FeedApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn checked(res: Response) -> ApiResult<Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ApiError::Unauthorized { body })
        } else {
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }

    async fn send_json<T>(&self, builder: RequestBuilder) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let res = Self::checked(builder.send().await?).await?;
        Ok(res.json::<T>().await?)
    }

    async fn send_unit(&self, builder: RequestBuilder) -> ApiResult<()> {
        Self::checked(builder.send().await?).await?;
        Ok(())
    }

    pub async fn fetch_notifications(
        &self,
        user_id: UserId,
        page: u32,
        size: u32,
    ) -> ApiResult<Vec<NotificationRecord>> {
        debug!(target: "feed.api", user_id, page, size, "fetching notifications");
        let envelope: PageEnvelope<NotificationRecord> = self
            .send_json(
                self.request(Method::GET, "/notifications").query(&[
                    ("page", page.to_string()),
                    ("size", size.to_string()),
                    ("userId", user_id.to_string()),
                ]),
            )
            .await?;
        Ok(envelope.content)
    }

    pub async fn unread_count(&self, user_id: UserId) -> ApiResult<u64> {
        self.send_json(
            self.request(Method::GET, "/notifications/unread/count")
                .query(&[("userId", user_id)]),
        )
        .await
    }

    pub async fn mark_read(&self, id: NotificationId) -> ApiResult<()> {
        self.send_unit(self.request(Method::PUT, &format!("/notifications/{id}/read")))
            .await
    }

    pub async fn mark_all_read(&self, user_id: UserId) -> ApiResult<()> {
        self.send_unit(
            self.request(Method::PUT, "/notifications/read-all")
                .query(&[("userId", user_id)]),
        )
        .await
    }

    pub async fn respond_to_request(
        &self,
        id: NotificationId,
        accept: bool,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> ApiResult<()> {
        self.send_unit(
            self.request(
                Method::POST,
                &format!("/notifications/message-request/{id}"),
            )
            .json(&MessageRequestResponse {
                accept,
                sender_id,
                recipient_id,
            }),
        )
        .await
    }

    pub async fn fetch_history(
        &self,
        user_id: UserId,
        buddy_id: UserId,
        last_message_id: Option<&str>,
        limit: u32,
    ) -> ApiResult<Vec<ChatMessage>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(last) = last_message_id {
            query.push(("lastMessageId", last.to_string()));
        }
        self.send_json(
            self.request(Method::GET, &format!("/message/chat/{user_id}/{buddy_id}"))
                .query(&query),
        )
        .await
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        content: &str,
    ) -> ApiResult<ChatMessage> {
        self.send_json(
            self.request(Method::POST, "/message/send")
                .json(&OutgoingChatMessage {
                    sender_id,
                    recipient_id,
                    message: content.to_string(),
                }),
        )
        .await
    }

    pub async fn add_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        self.send_unit(
            self.request(Method::POST, "/upvotes/add")
                .form(&[("userId", user_id.to_string()), ("topicId", topic_id.clone())]),
        )
        .await
    }

    pub async fn remove_upvote(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<()> {
        self.send_unit(
            self.request(Method::DELETE, "/upvotes/remove")
                .form(&[("userId", user_id.to_string()), ("topicId", topic_id.clone())]),
        )
        .await
    }

    pub async fn upvote_count(&self, topic_id: &TopicId) -> ApiResult<i64> {
        self.send_json(
            self.request(Method::GET, "/upvotes/count")
                .query(&[("topicId", topic_id)]),
        )
        .await
    }

    pub async fn has_upvoted(&self, user_id: UserId, topic_id: &TopicId) -> ApiResult<bool> {
        self.send_json(
            self.request(Method::GET, "/upvotes/hasUpvoted")
                .query(&[("userId", user_id.to_string()), ("topicId", topic_id.clone())]),
        )
        .await
    }
}
