//! Gateway configuration

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, Map};
use serde::Deserialize;

use crate::auth::DEFAULT_TOKEN_TTL;
use crate::chat::repo::DEFAULT_MAX_MESSAGES;
use crate::error::{Error, Result};
use crate::store::DEFAULT_CACHE_TTL;

/// Prefix of the environment variables read by [`GatewayConfig::from_env`]
pub const ENV_PREFIX: &str = "RC";

/// Which store and broker adapters to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared Redis for the store and the broker
    Redis,
    /// Process-local store and broker; single node only
    Memory,
}

/// Per-user limit on inbound chat frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Sustained frames per second
    pub rps: f64,
    /// Burst size
    pub burst: u64,
}

/// Gateway configuration options
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Node id; names this node's forwarding topic
    pub node_id: String,

    /// Machine id embedded in generated ids; unique per node
    pub machine_id: u16,

    /// Store and broker adapters
    pub store: StoreBackend,

    /// Redis URL, for [`StoreBackend::Redis`]
    pub redis_url: String,

    /// Secret for channel access tokens
    pub jwt_secret: String,

    /// Channel access token lifetime
    pub token_ttl: Duration,

    /// Workers delivering match results
    pub match_workers: usize,

    /// Workers delivering chat messages
    pub message_workers: usize,

    /// Largest accepted inbound frame in bytes
    pub max_message_size: usize,

    /// Messages returned when listing channel history
    pub max_messages: usize,

    /// Expiry of plain cached values
    pub cache_ttl: Duration,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Deliver chat messages through per-node forwarding topics instead of
    /// broadcasting to every node
    pub selective_forwarding: bool,

    /// Run the forwarder on this node (selective forwarding only)
    pub run_forwarder: bool,

    /// Inbound chat frame limit (None = unlimited)
    pub rate_limit: Option<RateLimit>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            node_id: format!("gw-{}", uuid::Uuid::new_v4().simple()),
            machine_id: 1,
            store: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jwt_secret: "replace-me".to_string(),
            token_ttl: DEFAULT_TOKEN_TTL,
            match_workers: 4,
            message_workers: 4,
            max_message_size: 4096,
            max_messages: DEFAULT_MAX_MESSAGES,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_connections: 0, // Unlimited
            selective_forwarding: false,
            run_forwarder: true,
            rate_limit: None,
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `RC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    /// Defaults overridden by `RC_*` entries of `vars` instead of the
    /// process environment
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
    }

    fn from_environment(env: Environment) -> Result<Self> {
        let settings: EnvSettings = Config::builder()
            .add_source(env.prefix_separator("_").ignore_empty(true))
            .build()?
            .try_deserialize()?;
        settings.apply(Self::default())
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn machine_id(mut self, machine_id: u16) -> Self {
        self.machine_id = machine_id;
        self
    }

    /// Select the store and broker adapters
    pub fn store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = secret.into();
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Set delivery worker counts
    pub fn workers(mut self, match_workers: usize, message_workers: usize) -> Self {
        self.match_workers = match_workers;
        self.message_workers = message_workers;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set how many messages a history listing returns (at least one)
    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = max.max(1);
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable per-node forwarding topics
    pub fn selective_forwarding(mut self) -> Self {
        self.selective_forwarding = true;
        self
    }

    /// Whether this node runs the forwarder when selective forwarding is on
    pub fn run_forwarder(mut self, run: bool) -> Self {
        self.run_forwarder = run;
        self
    }

    /// Limit inbound chat frames per user
    pub fn rate_limit(mut self, rps: f64, burst: u64) -> Self {
        self.rate_limit = Some(RateLimit {
            rps,
            burst: burst.max(1),
        });
        self
    }
}

/// `RC_*` variables, keyed without the prefix
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvSettings {
    bind_addr: Option<SocketAddr>,
    node_id: Option<String>,
    machine_id: Option<u16>,
    store: Option<String>,
    redis_url: Option<String>,
    jwt_secret: Option<String>,
    jwt_expiration_secs: Option<u64>,
    match_workers: Option<usize>,
    message_workers: Option<usize>,
    max_message_size: Option<usize>,
    max_messages: Option<usize>,
    cache_ttl_secs: Option<u64>,
    max_connections: Option<usize>,
    selective_forwarding: Option<bool>,
    run_forwarder: Option<bool>,
    rate_limit_rps: Option<f64>,
    rate_limit_burst: Option<u64>,
}

impl EnvSettings {
    fn apply(self, mut config: GatewayConfig) -> Result<GatewayConfig> {
        if let Some(store) = self.store {
            config.store = match store.trim().to_ascii_lowercase().as_str() {
                "redis" => StoreBackend::Redis,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(Error::Validation(format!(
                        "RC_STORE: unknown backend {:?}",
                        other
                    )))
                }
            };
        }

        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.node_id {
            config.node_id = v;
        }
        if let Some(v) = self.machine_id {
            config.machine_id = v;
        }
        if let Some(v) = self.redis_url {
            config.redis_url = v;
        }
        if let Some(v) = self.jwt_secret {
            config.jwt_secret = v;
        }
        if let Some(secs) = self.jwt_expiration_secs {
            config.token_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = self.match_workers {
            config.match_workers = v;
        }
        if let Some(v) = self.message_workers {
            config.message_workers = v;
        }
        if let Some(v) = self.max_message_size {
            config.max_message_size = v;
        }
        if let Some(v) = self.max_messages {
            config = config.max_messages(v);
        }
        if let Some(secs) = self.cache_ttl_secs {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = self.max_connections {
            config.max_connections = v;
        }
        if let Some(v) = self.selective_forwarding {
            config.selective_forwarding = v;
        }
        if let Some(v) = self.run_forwarder {
            config.run_forwarder = v;
        }
        if let Some(rps) = self.rate_limit_rps {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(Error::Validation(format!(
                    "RC_RATE_LIMIT_RPS: must be positive, got {}",
                    rps
                )));
            }
            let burst = self
                .rate_limit_burst
                .unwrap_or_else(|| rps.ceil().max(1.0) as u64);
            config = config.rate_limit(rps, burst);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.store, StoreBackend::Redis);
        assert_eq!(config.max_messages, 500);
        assert_eq!(config.max_connections, 0);
        assert!(!config.selective_forwarding);
        assert!(config.rate_limit.is_none());
        assert!(config.node_id.starts_with("gw-"));
    }

    #[test]
    fn test_env_overrides() {
        let config = GatewayConfig::from_vars([
            ("RC_BIND_ADDR", "127.0.0.1:7000"),
            ("RC_NODE_ID", "gw-7"),
            ("RC_STORE", "memory"),
            ("RC_MATCH_WORKERS", "8"),
            ("RC_JWT_EXPIRATION_SECS", "60"),
            ("RC_SELECTIVE_FORWARDING", "true"),
            ("RC_RATE_LIMIT_RPS", "2.5"),
            ("RC_MAX_MESSAGES", "0"),
            ("RC_UNRELATED", "x"),
            ("HOME", "/root"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.node_id, "gw-7");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.match_workers, 8);
        assert_eq!(config.token_ttl, Duration::from_secs(60));
        assert!(config.selective_forwarding);
        assert!(config.run_forwarder);
        assert_eq!(config.max_messages, 1);
        assert_eq!(
            config.rate_limit,
            Some(RateLimit {
                rps: 2.5,
                burst: 3
            })
        );
    }

    #[test]
    fn test_env_rejects_bad_values() {
        assert!(matches!(
            GatewayConfig::from_vars([("RC_MACHINE_ID", "70000")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::from_vars([("RC_MATCH_WORKERS", "many")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::from_vars([("RC_STORE", "etcd")]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            GatewayConfig::from_vars([("RC_RATE_LIMIT_RPS", "0")]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_env_empty_values_keep_defaults() {
        let config = GatewayConfig::from_vars([
            ("RC_NODE_ID", ""),
            ("RC_RATE_LIMIT_RPS", "4"),
            ("RC_RATE_LIMIT_BURST", "10"),
            ("RC_SELECTIVE_FORWARDING", "true"),
            ("RC_RUN_FORWARDER", "false"),
        ])
        .unwrap();

        assert!(config.node_id.starts_with("gw-"));
        assert_eq!(config.rate_limit.unwrap().burst, 10);
        assert!(config.selective_forwarding);
        assert!(!config.run_forwarder);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let config = GatewayConfig::default()
            .bind(addr)
            .node_id("a")
            .machine_id(9)
            .store(StoreBackend::Memory)
            .workers(2, 3)
            .max_messages(0)
            .max_connections(50)
            .selective_forwarding()
            .rate_limit(1.0, 0);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.node_id, "a");
        assert_eq!(config.machine_id, 9);
        assert_eq!(config.match_workers, 2);
        assert_eq!(config.message_workers, 3);
        assert_eq!(config.max_messages, 1);
        assert_eq!(config.max_connections, 50);
        assert!(config.selective_forwarding);
        assert!(config.run_forwarder);
        assert_eq!(config.rate_limit.unwrap().burst, 1);

        let listener_only = GatewayConfig::default().run_forwarder(false);
        assert!(!listener_only.selective_forwarding);
        assert!(!listener_only.run_forwarder);
        assert!(!listener_only.selective_forwarding().run_forwarder);
    }
}
