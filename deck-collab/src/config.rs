//! Configuration for sessions, the transport and the relay.

use std::time::Duration;

use deck_core::{ParticipantId, Permission, PresentationId};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Debounced writes wait at least this long...
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(500);
/// ...and at most this long.
pub const MAX_DEBOUNCE: Duration = Duration::from_millis(1000);

/// What the transport does after its connection closes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Wait `delay_ms` and retry, forever.
    Fixed { delay_ms: u64 },
    /// Double the delay after every failed attempt up to `max_ms`; stop
    /// after `max_attempts` consecutive failures when set.
    CappedExponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed { delay_ms: 3000 }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (starting at 1), or
    /// `None` once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Some(Duration::from_millis(delay_ms)),
            ReconnectPolicy::CappedExponential {
                initial_ms,
                max_ms,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| attempt > max) {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(32);
                let delay = initial_ms.saturating_mul(1u64 << exponent).min(max_ms);
                Some(Duration::from_millis(delay))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Full `ws://` / `wss://` URL of the presentation channel.
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the inbound event and outbound message channels.
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            channel_capacity: 256,
        }
    }
}

/// Everything a [`DocumentSession`](crate::session::DocumentSession) needs
/// to open a presentation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// REST root, e.g. `http://localhost:8000/api`.
    pub api_base_url: String,
    /// WebSocket root, e.g. `ws://localhost:8000`.
    pub ws_base_url: String,
    pub presentation_id: PresentationId,
    pub user_id: ParticipantId,
    pub username: String,
    pub reconnect: ReconnectPolicy,
    pub debounce_ms: u64,
    pub request_timeout_ms: u64,
    /// Broadcast every drag/resize move instead of only the final commit.
    pub broadcast_live_moves: bool,
    /// Evict silent participants after this long. Off when `None`.
    pub presence_idle_timeout_ms: Option<u64>,
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            ws_base_url: "ws://localhost:8000".to_string(),
            presentation_id: PresentationId(0),
            user_id: ParticipantId(0),
            username: "Anonymous".to_string(),
            reconnect: ReconnectPolicy::default(),
            debounce_ms: 800,
            request_timeout_ms: 10_000,
            broadcast_live_moves: false,
            presence_idle_timeout_ms: None,
            channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Config pointing at local test servers with short timings.
    pub fn for_testing(
        api_base_url: impl Into<String>,
        ws_base_url: impl Into<String>,
        presentation_id: PresentationId,
        user_id: ParticipantId,
        username: impl Into<String>,
    ) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ws_base_url: ws_base_url.into(),
            presentation_id,
            user_id,
            username: username.into(),
            reconnect: ReconnectPolicy::Fixed { delay_ms: 100 },
            debounce_ms: 500,
            request_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    /// Debounce delay, clamped to `[MIN_DEBOUNCE, MAX_DEBOUNCE]`.
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms).clamp(MIN_DEBOUNCE, MAX_DEBOUNCE)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn presence_idle_timeout(&self) -> Option<Duration> {
        self.presence_idle_timeout_ms.map(Duration::from_millis)
    }

    /// Channel URL for this presentation, carrying the participant identity
    /// as query parameters.
    pub fn socket_url(&self, permission: Permission) -> Result<String, ConfigError> {
        let base = format!(
            "{}/ws/presentations/{}/",
            self.ws_base_url.trim_end_matches('/'),
            self.presentation_id
        );
        let mut url = Url::parse(&base).map_err(|e| ConfigError::InvalidUrl {
            url: base.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("user_id", &self.user_id.to_string())
            .append_pair("username", &self.username)
            .append_pair("permission", permission.as_str());
        Ok(url.into())
    }

    pub fn transport(&self, permission: Permission) -> Result<TransportConfig, ConfigError> {
        Ok(TransportConfig {
            url: self.socket_url(permission)?,
            reconnect: self.reconnect.clone(),
            channel_capacity: self.channel_capacity,
        })
    }
}

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Messages buffered per room before slow peers start lagging.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    /// Read `DECK_RELAY_ADDR` and `DECK_RELAY_CAPACITY`, keeping defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("DECK_RELAY_ADDR").filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("DECK_RELAY_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
                _ => log::warn!("Ignoring DECK_RELAY_CAPACITY={raw}"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy_never_gives_up() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(10_000), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_capped_exponential() {
        let policy = ReconnectPolicy::CappedExponential {
            initial_ms: 500,
            max_ms: 4000,
            max_attempts: Some(5),
        };
        let delays: Vec<Option<u64>> = (1..=6)
            .map(|n| policy.delay_for(n).map(|d| d.as_millis() as u64))
            .collect();
        assert_eq!(delays, vec![Some(500), Some(1000), Some(2000), Some(4000), Some(4000), None]);
    }

    #[test]
    fn test_debounce_clamped() {
        let mut config = SessionConfig::default();
        assert_eq!(config.debounce_delay(), Duration::from_millis(800));
        config.debounce_ms = 50;
        assert_eq!(config.debounce_delay(), MIN_DEBOUNCE);
        config.debounce_ms = 5000;
        assert_eq!(config.debounce_delay(), MAX_DEBOUNCE);
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = SessionConfig::from_json(
            r#"{
                "presentation_id": 12,
                "user_id": 7,
                "username": "Ana",
                "reconnect": {"kind": "capped_exponential", "initial_ms": 250, "max_ms": 8000}
            }"#,
        )
        .unwrap();
        assert_eq!(config.presentation_id, PresentationId(12));
        assert_eq!(config.api_base_url, "http://localhost:8000/api");
        assert!(matches!(
            config.reconnect,
            ReconnectPolicy::CappedExponential { max_attempts: None, .. }
        ));
        assert!(!config.broadcast_live_moves);
    }

    #[test]
    fn test_socket_url_encodes_identity() {
        let config = SessionConfig::for_testing(
            "http://127.0.0.1:1/api",
            "ws://127.0.0.1:9000/",
            PresentationId(3),
            ParticipantId(7),
            "Ana Maria",
        );
        let url = config.socket_url(Permission::Editor).unwrap();
        assert!(url.starts_with("ws://127.0.0.1:9000/ws/presentations/3/?"));
        assert!(url.contains("user_id=7"));
        assert!(url.contains("username=Ana+Maria"));
        assert!(url.contains("permission=EDITOR"));
    }

    #[test]
    fn test_relay_config_from_lookup() {
        let config = RelayConfig::from_lookup(|key| match key {
            "DECK_RELAY_ADDR" => Some("0.0.0.0:9100".to_string()),
            "DECK_RELAY_CAPACITY" => Some("64".to_string()),
            _ => None,
        });
        assert_eq!(config.bind_addr, "0.0.0.0:9100");
        assert_eq!(config.broadcast_capacity, 64);

        let fallback = RelayConfig::from_lookup(|key| {
            (key == "DECK_RELAY_CAPACITY").then(|| "zero".to_string())
        });
        assert_eq!(fallback.bind_addr, "127.0.0.1:8000");
        assert_eq!(fallback.broadcast_capacity, 256);
    }
}
