use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// How long a fetch waits for material before answering 203.
    pub fetch_wait: Duration,
    /// Sessions untouched for this long are dropped.
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            port: env::var("TUNNEL_RELAY_PORT")
                .ok()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            fetch_wait: env::var("TUNNEL_RELAY_FETCH_WAIT_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_wait),
            session_ttl: env::var("TUNNEL_RELAY_SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            fetch_wait: Duration::from_secs(1),
            session_ttl: Duration::from_secs(300),
        }
    }
}
