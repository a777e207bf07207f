//! Configuration for the discovery protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DiscoveryError, DiscoveryResult};
use super::lookup::LookupConfig;
use super::rate_limiter::Quota;
use super::routing_table::DEFAULT_BUCKET_SIZE;
use super::session::SessionConfig;

/// Default discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9000;

const fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_request_retries() -> usize {
    1
}

const fn default_session_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_session_cache_capacity() -> usize {
    1000
}

const fn default_session_establish_timeout() -> Duration {
    Duration::from_secs(15)
}

const fn default_lookup_parallelism() -> usize {
    3
}

const fn default_lookup_request_limit() -> usize {
    3
}

const fn default_lookup_num_results() -> usize {
    16
}

const fn default_lookup_peer_iterations() -> usize {
    1
}

const fn default_lookup_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_ping_interval() -> Duration {
    Duration::from_secs(300)
}

const fn default_pending_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

const fn default_enr_update() -> bool {
    true
}

const fn default_addr_votes_to_update_enr() -> usize {
    10
}

const fn default_global_rate_limit() -> u32 {
    10_000
}

const fn default_ip_rate_limit() -> u32 {
    100
}

const fn default_rate_limit_period() -> Duration {
    Duration::from_secs(1)
}

const fn default_ban_duration() -> Duration {
    Duration::from_secs(60)
}

/// Durations are written in humantime form ("1s", "5m 30s").
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

/// Configuration for the discovery protocol.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Disable the discovery protocol.
    #[clap(name = "disable-discovery", long)]
    #[serde(default)]
    pub disable: bool,

    /// UDP port for discovery protocol.
    #[clap(name = "discovery-port", long, default_value_t = default_discovery_port())]
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Bind address for discovery UDP socket.
    ///
    /// If not specified, binds to 0.0.0.0 on the discovery port.
    #[clap(name = "discovery-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Private key for node identity (hex format, 32 bytes).
    ///
    /// If not provided, a new key will be generated on startup.
    #[clap(name = "discovery-private-key", long, env = "DISCOVERY_PRIVATE_KEY")]
    #[serde(default)]
    pub private_key: Option<String>,

    /// Bootstrap nodes to contact on startup.
    ///
    /// Format: discv5://<compressed_pubkey_hex>@<ip>:<port>
    #[clap(name = "discovery-bootstrap", long)]
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Kademlia bucket size (k parameter).
    #[clap(name = "discovery-bucket-size", long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// How long a full bucket waits for its oldest entry before evicting it.
    #[clap(name = "discovery-pending-timeout", long, value_parser = humantime::parse_duration, default_value = "60s")]
    #[serde(default = "default_pending_timeout", with = "humantime_duration")]
    pub pending_timeout: Duration,

    /// Time to wait for a response before retrying a request.
    #[clap(name = "discovery-request-timeout", long, value_parser = humantime::parse_duration, default_value = "1s")]
    #[serde(default = "default_request_timeout", with = "humantime_duration")]
    pub request_timeout: Duration,

    /// Retransmissions of an unanswered request.
    #[clap(name = "discovery-request-retries", long, default_value_t = default_request_retries())]
    #[serde(default = "default_request_retries")]
    pub request_retries: usize,

    /// Lifetime of an established session.
    #[clap(name = "discovery-session-timeout", long, value_parser = humantime::parse_duration, default_value = "24h")]
    #[serde(default = "default_session_timeout", with = "humantime_duration")]
    pub session_timeout: Duration,

    /// Maximum number of cached sessions.
    #[clap(name = "discovery-session-cache-capacity", long, default_value_t = default_session_cache_capacity())]
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,

    /// Time allowed for a handshake to complete.
    #[clap(name = "discovery-session-establish-timeout", long, value_parser = humantime::parse_duration, default_value = "15s")]
    #[serde(default = "default_session_establish_timeout", with = "humantime_duration")]
    pub session_establish_timeout: Duration,

    /// Concurrent FINDNODE requests per lookup.
    #[clap(name = "discovery-lookup-parallelism", long, default_value_t = default_lookup_parallelism())]
    #[serde(default = "default_lookup_parallelism")]
    pub lookup_parallelism: usize,

    /// Distances asked for in a single FINDNODE.
    #[clap(name = "discovery-lookup-request-limit", long, default_value_t = default_lookup_request_limit())]
    #[serde(default = "default_lookup_request_limit")]
    pub lookup_request_limit: usize,

    /// Number of nodes a lookup returns.
    #[clap(name = "discovery-lookup-num-results", long, default_value_t = default_lookup_num_results())]
    #[serde(default = "default_lookup_num_results")]
    pub lookup_num_results: usize,

    /// FINDNODE requests sent to each peer during a lookup.
    #[clap(name = "discovery-lookup-peer-iterations", long, default_value_t = default_lookup_peer_iterations())]
    #[serde(default = "default_lookup_peer_iterations")]
    pub lookup_peer_iterations: usize,

    /// Upper bound on the duration of a lookup.
    #[clap(name = "discovery-lookup-timeout", long, value_parser = humantime::parse_duration, default_value = "60s")]
    #[serde(default = "default_lookup_timeout", with = "humantime_duration")]
    pub lookup_timeout: Duration,

    /// Interval between keep-alive pings to connected peers.
    #[clap(name = "discovery-ping-interval", long, value_parser = humantime::parse_duration, default_value = "5m")]
    #[serde(default = "default_ping_interval", with = "humantime_duration")]
    pub ping_interval: Duration,

    /// Interval between random-target lookups.
    #[clap(name = "discovery-refresh-interval", long, value_parser = humantime::parse_duration, default_value = "5m")]
    #[serde(default = "default_refresh_interval", with = "humantime_duration")]
    pub refresh_interval: Duration,

    /// Update the local record from the addresses peers report.
    #[clap(name = "discovery-enr-update", long, default_value_t = default_enr_update(), action = clap::ArgAction::Set)]
    #[serde(default = "default_enr_update")]
    pub enr_update: bool,

    /// Identical address votes needed to update the local record.
    #[clap(name = "discovery-addr-votes", long, default_value_t = default_addr_votes_to_update_enr())]
    #[serde(default = "default_addr_votes_to_update_enr")]
    pub addr_votes_to_update_enr: usize,

    /// Packets accepted from all sources per rate limit period.
    #[clap(name = "discovery-global-rate-limit", long, default_value_t = default_global_rate_limit())]
    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit: u32,

    /// Packets accepted from a single IP per rate limit period.
    #[clap(name = "discovery-ip-rate-limit", long, default_value_t = default_ip_rate_limit())]
    #[serde(default = "default_ip_rate_limit")]
    pub ip_rate_limit: u32,

    #[clap(name = "discovery-rate-limit-period", long, value_parser = humantime::parse_duration, default_value = "1s")]
    #[serde(default = "default_rate_limit_period", with = "humantime_duration")]
    pub rate_limit_period: Duration,

    /// How long an IP exceeding its rate limit is ignored.
    #[clap(name = "discovery-ban-duration", long, value_parser = humantime::parse_duration, default_value = "60s")]
    #[serde(default = "default_ban_duration", with = "humantime_duration")]
    pub ban_duration: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            disable: false,
            port: DEFAULT_DISCOVERY_PORT,
            bind_address: None,
            private_key: None,
            bootstrap_nodes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            pending_timeout: default_pending_timeout(),
            request_timeout: default_request_timeout(),
            request_retries: default_request_retries(),
            session_timeout: default_session_timeout(),
            session_cache_capacity: default_session_cache_capacity(),
            session_establish_timeout: default_session_establish_timeout(),
            lookup_parallelism: default_lookup_parallelism(),
            lookup_request_limit: default_lookup_request_limit(),
            lookup_num_results: default_lookup_num_results(),
            lookup_peer_iterations: default_lookup_peer_iterations(),
            lookup_timeout: default_lookup_timeout(),
            ping_interval: default_ping_interval(),
            refresh_interval: default_refresh_interval(),
            enr_update: default_enr_update(),
            addr_votes_to_update_enr: default_addr_votes_to_update_enr(),
            global_rate_limit: default_global_rate_limit(),
            ip_rate_limit: default_ip_rate_limit(),
            rate_limit_period: default_rate_limit_period(),
            ban_duration: default_ban_duration(),
        }
    }
}

impl DiscoveryConfig {
    /// Get the bind address for the UDP socket.
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    /// Check if discovery is enabled.
    pub fn is_enabled(&self) -> bool {
        !self.disable
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> DiscoveryResult<()> {
        let checks = [
            (self.bucket_size, "bucket size"),
            (self.session_cache_capacity, "session cache capacity"),
            (self.lookup_parallelism, "lookup parallelism"),
            (self.lookup_request_limit, "lookup request limit"),
            (self.lookup_num_results, "lookup result count"),
            (self.lookup_peer_iterations, "lookup peer iterations"),
            (self.global_rate_limit as usize, "global rate limit"),
            (self.ip_rate_limit as usize, "per-IP rate limit"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(DiscoveryError::ConfigError(format!("{} must be non-zero", name)));
            }
        }
        if self.rate_limit_period.is_zero() {
            return Err(DiscoveryError::ConfigError(
                "rate limit period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: self.request_timeout,
            request_retries: self.request_retries,
            session_timeout: self.session_timeout,
            session_cache_capacity: self.session_cache_capacity,
            session_establish_timeout: self.session_establish_timeout,
        }
    }

    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            parallelism: self.lookup_parallelism,
            num_results: self.lookup_num_results,
            request_limit: self.lookup_request_limit,
            peer_iterations: self.lookup_peer_iterations,
            timeout: self.lookup_timeout,
        }
    }

    pub fn global_quota(&self) -> Quota {
        Quota {
            replenish_all_every: self.rate_limit_period,
            max_tokens: self.global_rate_limit,
        }
    }

    pub fn ip_quota(&self) -> Quota {
        Quota {
            replenish_all_every: self.rate_limit_period,
            max_tokens: self.ip_rate_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();

        assert_eq!(config.port, DEFAULT_DISCOVERY_PORT);
        assert!(config.private_key.is_none());
        assert!(config.bootstrap_nodes.is_empty());
        assert_eq!(config.bucket_size, DEFAULT_BUCKET_SIZE);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.lookup_parallelism, 3);
        assert_eq!(config.lookup_num_results, 16);
        assert!(config.enr_update);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_get_bind_address() {
        let mut config = DiscoveryConfig::default();
        assert_eq!(config.get_bind_address(), "0.0.0.0:9000");

        config.bind_address = Some("127.0.0.1:9999".to_string());
        assert_eq!(config.get_bind_address(), "127.0.0.1:9999");
    }

    #[test]
    fn test_is_enabled() {
        let mut config = DiscoveryConfig::default();
        assert!(config.is_enabled());

        config.disable = true;
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = DiscoveryConfig::default();
        config.lookup_parallelism = 0;
        assert!(matches!(
            config.validate(),
            Err(DiscoveryError::ConfigError(msg)) if msg.contains("parallelism")
        ));

        let mut config = DiscoveryConfig::default();
        config.ip_rate_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_in_json() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"request_timeout": "2s", "lookup_timeout": "1m 30s"}"#)
                .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.lookup_timeout, Duration::from_secs(90));
        // unspecified fields keep their defaults
        assert_eq!(config.session_timeout, Duration::from_secs(86400));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""request_timeout":"2s""#));
    }

    #[test]
    fn test_cli_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[clap(flatten)]
            discovery: DiscoveryConfig,
        }

        let cli = Cli::parse_from([
            "discv5",
            "--discovery-request-timeout",
            "500ms",
            "--discovery-bootstrap",
            "discv5://02aa@127.0.0.1:9000",
        ]);
        assert_eq!(cli.discovery.request_timeout, Duration::from_millis(500));
        assert_eq!(cli.discovery.bootstrap_nodes.len(), 1);
        assert_eq!(cli.discovery.ping_interval, Duration::from_secs(300));
    }
}
