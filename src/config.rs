//! Configuration types — all knobs are environment-driven.

use std::time::Duration;

use secrecy::SecretString;

/// Task timeout floor. Sub-second timeouts would let the sweeper race every
/// freshly admitted entry, so anything below this is clamped up.
pub const MIN_TASK_TIMEOUT_SECS: u64 = 5;

/// Task timeout ceiling (1 hour).
pub const MAX_TASK_TIMEOUT_SECS: u64 = 3600;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret for Bearer auth. None disables auth (dev mode).
    pub shared_secret: Option<SecretString>,
    /// Fixed port; when None the range below is scanned.
    pub port: Option<u16>,
    /// Inclusive port range scanned for a free port.
    pub port_range: (u16, u16),
    /// Age after which a pending entry is forced to `timeout`.
    pub task_timeout: Duration,
    /// Sweeper pass interval.
    pub sweep_interval: Duration,
    /// CSRF token cache capacity.
    pub csrf_cache_size: usize,
    /// CSRF token lifetime.
    pub csrf_ttl: Duration,
    /// Rate limit: max requests per window per caller.
    pub rate_limit_max: u32,
    /// Rate limit window.
    pub rate_limit_window: Duration,
    /// Hard request body cap in bytes.
    pub max_body_bytes: usize,
    /// Live connection cap.
    pub max_connections: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Event ring-buffer capacity.
    pub event_buffer: usize,
    /// Directory heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Agent-directory base URL. None means no directory (standalone).
    pub directory_url: Option<String>,
    /// Database file path.
    pub db_path: String,
    /// Platform tag stamped on tasks submitted through this server.
    pub platform: String,
    /// Agent identifier this server registers under.
    pub agent_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            port: None,
            port_range: (41100, 41199),
            task_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            csrf_cache_size: 500,
            csrf_ttl: Duration::from_secs(1800),
            rate_limit_max: 60,
            rate_limit_window: Duration::from_secs(60),
            max_body_bytes: 256 * 1024,
            max_connections: 256,
            request_timeout: Duration::from_secs(30),
            event_buffer: 512,
            heartbeat_interval: Duration::from_secs(30),
            directory_url: None,
            db_path: "./data/a2a.db".to_string(),
            platform: "a2a-relay".to_string(),
            agent_name: "a2a-relay".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from `A2A_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let shared_secret = std::env::var("A2A_SHARED_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        let port = env_parse::<u16>("A2A_PORT");

        let port_range = std::env::var("A2A_PORT_RANGE")
            .ok()
            .and_then(|s| parse_port_range(&s))
            .unwrap_or(defaults.port_range);

        let task_timeout_secs = env_parse::<u64>("A2A_TASK_TIMEOUT_SECS")
            .unwrap_or(defaults.task_timeout.as_secs())
            .clamp(MIN_TASK_TIMEOUT_SECS, MAX_TASK_TIMEOUT_SECS);

        Self {
            shared_secret,
            port,
            port_range,
            task_timeout: Duration::from_secs(task_timeout_secs),
            sweep_interval: Duration::from_secs(
                env_parse("A2A_SWEEP_INTERVAL_SECS")
                    .unwrap_or(defaults.sweep_interval.as_secs())
                    .max(1),
            ),
            csrf_cache_size: env_parse("A2A_CSRF_CACHE_SIZE")
                .unwrap_or(defaults.csrf_cache_size)
                .max(1),
            csrf_ttl: Duration::from_secs(
                env_parse("A2A_CSRF_TTL_SECS").unwrap_or(defaults.csrf_ttl.as_secs()),
            ),
            rate_limit_max: env_parse("A2A_RATE_LIMIT_MAX").unwrap_or(defaults.rate_limit_max),
            rate_limit_window: Duration::from_secs(
                env_parse("A2A_RATE_LIMIT_WINDOW_SECS")
                    .unwrap_or(defaults.rate_limit_window.as_secs()),
            ),
            max_body_bytes: env_parse("A2A_MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            max_connections: env_parse("A2A_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            request_timeout: Duration::from_secs(
                env_parse("A2A_REQUEST_TIMEOUT_SECS")
                    .unwrap_or(defaults.request_timeout.as_secs()),
            ),
            event_buffer: env_parse("A2A_EVENT_BUFFER")
                .unwrap_or(defaults.event_buffer)
                .max(1),
            heartbeat_interval: Duration::from_secs(
                env_parse("A2A_HEARTBEAT_SECS")
                    .unwrap_or(defaults.heartbeat_interval.as_secs())
                    .max(1),
            ),
            directory_url: std::env::var("A2A_DIRECTORY_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            db_path: std::env::var("A2A_DB_PATH").unwrap_or(defaults.db_path),
            platform: std::env::var("A2A_PLATFORM").unwrap_or(defaults.platform),
            agent_name: std::env::var("A2A_AGENT_NAME").unwrap_or(defaults.agent_name),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Parse `"41100-41199"` into an inclusive range tuple.
fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (start, end) = s.split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start <= end { Some((start, end)) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert!(cfg.task_timeout.as_secs() >= MIN_TASK_TIMEOUT_SECS);
        assert!(cfg.port_range.0 <= cfg.port_range.1);
        assert!(cfg.event_buffer > 0);
    }

    #[test]
    fn port_range_parses() {
        assert_eq!(parse_port_range("41100-41199"), Some((41100, 41199)));
        assert_eq!(parse_port_range("8080 - 8090"), Some((8080, 8090)));
        assert_eq!(parse_port_range("9000-8000"), None);
        assert_eq!(parse_port_range("nope"), None);
    }
}
