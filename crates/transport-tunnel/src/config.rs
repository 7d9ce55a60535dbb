use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TunnelError;

pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:8080";
/// Largest payload handed to the transport in one message.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingMode {
    Polling,
    Duplex,
}

impl FromStr for SignalingMode {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" | "http" => Ok(SignalingMode::Polling),
            "ws" | "websocket" | "duplex" => Ok(SignalingMode::Duplex),
            other => Err(TunnelError::Parse(format!("unknown signaling mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub mode: SignalingMode,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    /// How long a closed session keeps absorbing late deliveries.
    pub session_grace: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            mode: SignalingMode::Polling,
            poll_interval: Duration::from_millis(200),
            reconnect_interval: Duration::from_secs(5),
            session_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_open_timeout: Duration,
    pub create_attempts: usize,
    /// Capacity of each per-kind accept queue of a listener.
    pub accept_backlog: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(30),
            keepalive_open_timeout: Duration::from_secs(60),
            create_attempts: 5,
            accept_backlog: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub signaling: SignalingConfig,
    pub peer: PeerConfig,
    pub ice_servers: Vec<String>,
}

impl TunnelConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| normalize_opt(lookup(key));
        let defaults = TunnelConfig::default();

        let mode = get("TUNNEL_SIGNALING_MODE")
            .and_then(|raw| match raw.parse::<SignalingMode>() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring TUNNEL_SIGNALING_MODE");
                    None
                }
            })
            .unwrap_or(defaults.signaling.mode);

        let signaling = SignalingConfig {
            url: get("TUNNEL_SIGNALING_URL").unwrap_or(defaults.signaling.url),
            mode,
            poll_interval: get("TUNNEL_POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.signaling.poll_interval),
            reconnect_interval: get("TUNNEL_RECONNECT_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.signaling.reconnect_interval),
            session_grace: defaults.signaling.session_grace,
        };

        let peer = PeerConfig {
            handshake_timeout: get("TUNNEL_HANDSHAKE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer.handshake_timeout),
            keepalive_interval: get("TUNNEL_KEEPALIVE_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer.keepalive_interval),
            keepalive_open_timeout: get("TUNNEL_KEEPALIVE_OPEN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.peer.keepalive_open_timeout),
            ..defaults.peer
        };

        let ice_servers = get("TUNNEL_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            signaling,
            peer,
            ice_servers,
        }
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> TunnelConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TunnelConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test_timeout::timeout]
    fn defaults_when_unset_or_blank() {
        let config = config_from(&[("TUNNEL_SIGNALING_URL", "   ")]);
        assert_eq!(config.signaling.url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.signaling.mode, SignalingMode::Polling);
        assert_eq!(config.peer.handshake_timeout, Duration::from_secs(120));
        assert_eq!(config.peer.keepalive_interval, Duration::from_secs(30));
        assert!(config.ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn reads_overrides() {
        let config = config_from(&[
            ("TUNNEL_SIGNALING_URL", "https://relay.example.com"),
            ("TUNNEL_SIGNALING_MODE", "ws"),
            ("TUNNEL_POLL_INTERVAL_MS", "50"),
            ("TUNNEL_HANDSHAKE_TIMEOUT_SECS", "10"),
            ("TUNNEL_ICE_SERVERS", "stun:stun.l.google.com:19302, ,turn:t.example.com"),
        ]);
        assert_eq!(config.signaling.url, "https://relay.example.com");
        assert_eq!(config.signaling.mode, SignalingMode::Duplex);
        assert_eq!(config.signaling.poll_interval, Duration::from_millis(50));
        assert_eq!(config.peer.handshake_timeout, Duration::from_secs(10));
        assert_eq!(
            config.ice_servers,
            vec!["stun:stun.l.google.com:19302", "turn:t.example.com"]
        );
    }
}
