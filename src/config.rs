#![forbid(unsafe_code)]

// Server configuration read from the environment

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// How long a room outlives its disconnected owner
    pub grace_period: Duration,
    /// Shared reservation store; in-process when unset
    pub redis_url: Option<String>,
    /// Owner token written next to every reservation this instance makes
    pub instance_id: String,
    pub metrics_token: Option<String>,
    /// Address advertised in ICE candidates
    pub announced_ip: IpAddr,
}

impl ServerConfig {
    /// Reads the configuration. Malformed numbers fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let port = lookup("PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let mut max_connections = parsed("MAX_CONNECTIONS")
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!(
                "MAX_CONNECTIONS=0 would reject all connections, using default {}",
                DEFAULT_MAX_CONNECTIONS
            );
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let grace_period =
            Duration::from_secs(parsed("GRACE_PERIOD_SECS").unwrap_or(DEFAULT_GRACE_PERIOD_SECS));

        let instance_id = lookup("INSTANCE_ID")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let announced_ip = match lookup("ANNOUNCE_IP") {
            Some(ip) => ip.trim().parse().unwrap_or_else(|_| {
                warn!("Invalid ANNOUNCE_IP {}, using 127.0.0.1", ip);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }),
            None => {
                info!("No ANNOUNCE_IP set, using 127.0.0.1");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        };

        Self {
            port,
            max_connections,
            grace_period,
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            instance_id,
            metrics_token: lookup("METRICS_TOKEN").filter(|v| !v.is_empty()),
            announced_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert!(config.redis_url.is_none());
        assert!(config.metrics_token.is_none());
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = config(&[
            ("PORT", "http"),
            ("MAX_CONNECTIONS", "0"),
            ("GRACE_PERIOD_SECS", "-5"),
            ("ANNOUNCE_IP", "not-an-ip"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.announced_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_explicit_values() {
        let config = config(&[
            ("PORT", "8080"),
            ("GRACE_PERIOD_SECS", "5"),
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("INSTANCE_ID", "node-1"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.instance_id, "node-1");
    }
}
