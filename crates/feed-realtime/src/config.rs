use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::connection::{ChannelConfig, ChannelKind};

/// Runtime settings of a realtime session, read from `FEED_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_push_endpoint")]
    pub push_endpoint: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Zero disables outgoing heartbeats.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_outgoing_ms: u64,
    /// Expected inbound heartbeat interval. Zero disables the inbound
    /// watchdog.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_incoming_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_notification_page_size")]
    pub notification_page_size: u32,
    #[serde(default = "default_chat_history_limit")]
    pub chat_history_limit: u32,
    /// Zero disables the periodic notification resync.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            push_endpoint: default_push_endpoint(),
            api_base: default_api_base(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_outgoing_ms: default_heartbeat_ms(),
            heartbeat_incoming_ms: default_heartbeat_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            notification_page_size: default_notification_page_size(),
            chat_history_limit: default_chat_history_limit(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("FEED").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<RealtimeConfig>())
            .map(RealtimeConfig::normalize)
            .unwrap_or_else(|err| {
                warn!(
                    target: "realtime.config",
                    error = %err,
                    "invalid FEED_* configuration; using defaults"
                );
                RealtimeConfig::default()
            })
    }

    fn normalize(mut self) -> Self {
        self.push_endpoint = self.push_endpoint.trim().to_string();
        if self.push_endpoint.is_empty() {
            self.push_endpoint = default_push_endpoint();
        }
        self.api_base = self.api_base.trim().trim_end_matches('/').to_string();
        if self.api_base.is_empty() {
            self.api_base = default_api_base();
        }
        if self.notification_page_size == 0 {
            self.notification_page_size = default_notification_page_size();
        }
        if self.chat_history_limit == 0 {
            self.chat_history_limit = default_chat_history_limit();
        }
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_outgoing(&self) -> Option<Duration> {
        non_zero_millis(self.heartbeat_outgoing_ms)
    }

    /// Silence longer than twice the incoming heartbeat interval counts as a
    /// closed transport.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.heartbeat_incoming_ms.saturating_mul(2))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn channel(&self, channel: ChannelKind) -> ChannelConfig {
        ChannelConfig {
            channel,
            endpoint: self.push_endpoint.clone(),
            reconnect_delay: self.reconnect_delay(),
            heartbeat_outgoing: self.heartbeat_outgoing(),
            heartbeat_timeout: self.heartbeat_timeout(),
            connect_timeout: self.connect_timeout(),
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn default_push_endpoint() -> String {
    "http://localhost:8080/ws".to_string()
}

fn default_api_base() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    4_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_notification_page_size() -> u32 {
    10
}

fn default_chat_history_limit() -> u32 {
    50
}

fn default_resync_interval_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_push_client_settings() {
        let config = RealtimeConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_outgoing(), Some(Duration::from_secs(4)));
        assert_eq!(config.heartbeat_timeout(), Some(Duration::from_secs(8)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.notification_page_size, 10);
        assert_eq!(config.chat_history_limit, 50);
    }

    #[test]
    fn zero_intervals_disable_timers() {
        let config = RealtimeConfig {
            heartbeat_outgoing_ms: 0,
            heartbeat_incoming_ms: 0,
            resync_interval_secs: 0,
            ..RealtimeConfig::default()
        };
        assert_eq!(config.heartbeat_outgoing(), None);
        assert_eq!(config.heartbeat_timeout(), None);
        assert_eq!(config.resync_interval(), None);
        let channel = config.channel(ChannelKind::Chat);
        assert_eq!(channel.heartbeat_timeout, None);
        assert_eq!(channel.endpoint, "http://localhost:8080/ws");
    }

    #[test]
    fn normalize_repairs_unusable_values() {
        let config = RealtimeConfig {
            api_base: " http://api.local/api/ ".into(),
            push_endpoint: "  ".into(),
            notification_page_size: 0,
            ..RealtimeConfig::default()
        }
        .normalize();
        assert_eq!(config.api_base, "http://api.local/api");
        assert_eq!(config.push_endpoint, "http://localhost:8080/ws");
        assert_eq!(config.notification_page_size, 10);
    }
}
