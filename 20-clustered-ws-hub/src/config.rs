use std::time::Duration;

/// Identity and group used when the upgrade request leaves them unset.
pub const DEFAULT_SCOPE: &str = "default";

pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";
pub const DEFAULT_REDIS_CHANNEL: &str = "ws:broadcast";

const IDENTITY_CHANNEL_PREFIX: &str = "ws:user:";

/// Name of the backplane channel carrying notifications for one identity.
pub fn identity_channel(identity: &str) -> String {
    format!("{IDENTITY_CHANNEL_PREFIX}{identity}")
}

/// Falls back to [`DEFAULT_SCOPE`] for a missing or empty query value.
pub fn scope_or_default(value: Option<String>) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered between producers and the hub loop.
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { event_buffer: 128 }
    }
}

/// Per-connection limits and timers.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    /// Read deadline, refreshed whenever the peer answers a ping.
    pub pong_wait: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: 1 << 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackplaneConfig {
    pub address: String,
    pub channel: String,
    pub probe_timeout: Duration,
    /// Upper bound on a single publish round trip.
    pub publish_timeout: Duration,
}

impl BackplaneConfig {
    /// Connection URL for the redis client. Bare `host:port` values get a scheme.
    pub fn redis_url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("redis://{}", self.address)
        }
    }
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_REDIS_ADDR.to_string(),
            channel: DEFAULT_REDIS_CHANNEL.to_string(),
            probe_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_redis_scheme() {
        let config = BackplaneConfig::default();
        assert_eq!(config.redis_url(), "redis://localhost:6379");

        let config = BackplaneConfig {
            address: "rediss://cache.internal:6380/2".into(),
            ..BackplaneConfig::default()
        };
        assert_eq!(config.redis_url(), "rediss://cache.internal:6380/2");
    }

    #[test]
    fn empty_scope_falls_back_to_default() {
        assert_eq!(scope_or_default(None), "default");
        assert_eq!(scope_or_default(Some(String::new())), "default");
        assert_eq!(scope_or_default(Some("teamA".into())), "teamA");
    }

    #[test]
    fn identity_channels_are_prefixed() {
        assert_eq!(identity_channel("alice"), "ws:user:alice");
    }
}
