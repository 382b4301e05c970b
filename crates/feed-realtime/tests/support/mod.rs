#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use feed_api::memory::InMemoryFeedApi;
use feed_proto::{
    ChatMessage, ChatStatus, NotificationId, NotificationKind, NotificationRecord,
    NotificationStatus, UserId,
};
use feed_realtime::{RealtimeConfig, RealtimeSession, SessionApis};
use push_transport::{LocalBroker, PushTransport};

pub const USER: UserId = 7;
pub const BUDDY: UserId = 9;

pub fn at(minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|day| day.and_hms_opt(9, minute, 0))
        .expect("valid time")
}

pub fn notification(id: NotificationId, minute: u32) -> NotificationRecord {
    NotificationRecord {
        id,
        kind: NotificationKind::Upvote,
        sender_id: 100 + id,
        recipient_id: USER,
        message: format!("notification {id}"),
        status: NotificationStatus::Unread,
        timestamp: at(minute),
        reference_id: None,
    }
}

pub fn chat_message(id: &str, from: UserId, to: UserId, minute: u32) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        sender_id: from,
        recipient_id: to,
        content: format!("text {id}"),
        timestamp: at(minute),
        status: ChatStatus::Sent,
    }
}

pub fn json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("serialize payload")
}

pub fn quiet_config() -> RealtimeConfig {
    RealtimeConfig {
        resync_interval_secs: 0,
        ..RealtimeConfig::default()
    }
}

pub fn start_session(
    broker: &LocalBroker,
    api: &Arc<InMemoryFeedApi>,
    config: RealtimeConfig,
) -> RealtimeSession {
    init_logging();
    let transport: Arc<dyn PushTransport> = Arc::new(broker.clone());
    RealtimeSession::new(USER, config, transport, SessionApis::from_backend(api.clone()))
}

/// Honors RUST_LOG; output is captured per test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` on the paused clock until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
