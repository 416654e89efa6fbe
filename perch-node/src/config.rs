use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use perch_relay::options::DEFAULT_LISTEN_ADDRS;
use perch_relay::protocol::{
    DEFAULT_TOPIC, DISCOVERY_INTERVAL, DISCOVERY_SERVICE_TAG, IDLE_CONNECTION_TIMEOUT,
    PUBLISH_INTERVAL,
};
use perch_relay::{
    DiscoveryConfig, JoinOptions, Multiaddr, MuxerKind, NetworkOptions, PublishOptions,
    SecurityKind, SelfDelivery, TransportKind,
};

use crate::error::NodeError;

/// Name of the configuration file written by `perch init`.
pub const CONFIG_FILE_NAME: &str = "perch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub pubsub: PubSubConfig,
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transports in preference order: "tcp", "ws".
    pub transports: Vec<String>,
    /// Exactly one of "noise" or "tls".
    pub security: String,
    pub muxers: Vec<String>,
    pub listen_addrs: Vec<String>,
    /// Peers dialed once at startup, as multiaddrs.
    #[serde(default)]
    pub boot_nodes: Vec<String>,
    /// Hex-encoded 32-byte seed for a deterministic peer identity.
    #[serde(default)]
    pub keypair_seed: Option<String>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_connection_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    IDLE_CONNECTION_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    pub topic: String,
    pub publish_interval_ms: u64,
    pub sender_label: String,
    pub body: String,
    /// Deliver this node's own publishes to its own subscription.
    #[serde(default = "default_loopback")]
    pub loopback: bool,
    /// Treat "no peers subscribed" as a publish failure.
    #[serde(default)]
    pub require_peers: bool,
}

fn default_loopback() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub service_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long background tasks get to stop before they are aborted.
    pub shutdown_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                transports: vec!["tcp".to_string(), "ws".to_string()],
                security: "noise".to_string(),
                muxers: vec!["yamux".to_string()],
                listen_addrs: DEFAULT_LISTEN_ADDRS.iter().map(|s| s.to_string()).collect(),
                boot_nodes: Vec::new(),
                keypair_seed: None,
                idle_connection_timeout_secs: default_idle_timeout_secs(),
            },
            pubsub: PubSubConfig {
                topic: DEFAULT_TOPIC.to_string(),
                publish_interval_ms: PUBLISH_INTERVAL.as_millis() as u64,
                sender_label: "from localhost".to_string(),
                body: "hello world".to_string(),
                loopback: true,
                require_peers: false,
            },
            discovery: DiscoverySection {
                enabled: true,
                interval_secs: DISCOVERY_INTERVAL.as_secs(),
                service_tag: DISCOVERY_SERVICE_TAG.to_string(),
            },
            lifecycle: LifecycleConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, NodeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to read config file '{}': {}", path, e),
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to parse config file '{}': {}", path, e),
        })?;
        Ok(config)
    }

    /// Initialize a default configuration file in the given directory.
    pub fn init(dir: &str) -> Result<(), NodeError> {
        let dir_path = Path::new(dir);
        if !dir_path.exists() {
            std::fs::create_dir_all(dir_path)?;
        }

        let config = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&config).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to serialize default config: {}", e),
        })?;

        let config_path = dir_path.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, toml_str)?;

        Ok(())
    }

    /// Turn the `[network]` section into a validated capability set.
    pub fn to_network_options(&self) -> Result<NetworkOptions, NodeError> {
        let mut builder = NetworkOptions::builder();
        for name in &self.network.transports {
            builder = builder.transport(parse_kind::<TransportKind>(name)?);
        }
        builder = builder.security(parse_kind::<SecurityKind>(&self.network.security)?);
        for name in &self.network.muxers {
            builder = builder.muxer(parse_kind::<MuxerKind>(name)?);
        }
        for addr in &self.network.listen_addrs {
            builder = builder.listen_addr(addr.as_str());
        }
        if let Some(seed) = self.keypair_seed()? {
            builder = builder.keypair_seed(seed);
        }
        builder = builder
            .idle_connection_timeout(Duration::from_secs(self.network.idle_connection_timeout_secs));

        builder.build().map_err(|e| NodeError::ConfigError {
            reason: e.to_string(),
        })
    }

    fn keypair_seed(&self) -> Result<Option<[u8; 32]>, NodeError> {
        let Some(seed_hex) = &self.network.keypair_seed else {
            return Ok(None);
        };
        let seed_bytes = hex::decode(seed_hex).map_err(|e| NodeError::ConfigError {
            reason: format!("invalid keypair seed hex: {}", e),
        })?;
        let seed: [u8; 32] = seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::ConfigError {
                reason: format!("keypair seed must be 32 bytes, got {}", seed_bytes.len()),
            })?;
        Ok(Some(seed))
    }

    /// Parsed `network.boot_nodes`.
    pub fn boot_addrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.network
            .boot_nodes
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>().map_err(|e| NodeError::ConfigError {
                    reason: format!("invalid boot node multiaddr '{}': {}", s, e),
                })
            })
            .collect()
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            interval: Duration::from_secs(self.discovery.interval_secs),
            service_tag: self.discovery.service_tag.clone(),
        }
    }

    pub fn join_options(&self) -> JoinOptions {
        JoinOptions {
            self_delivery: if self.pubsub.loopback {
                SelfDelivery::Deliver
            } else {
                SelfDelivery::Suppress
            },
        }
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            require_peers: self.pubsub.require_peers,
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.pubsub.publish_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.lifecycle.shutdown_grace_ms)
    }

    /// Checks not covered by building the network options.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.pubsub.topic.is_empty() {
            return Err(NodeError::ConfigError {
                reason: "pubsub.topic must not be empty".to_string(),
            });
        }
        if self.pubsub.publish_interval_ms == 0 {
            return Err(NodeError::ConfigError {
                reason: "pubsub.publish_interval_ms must be greater than zero".to_string(),
            });
        }
        self.boot_addrs()?;
        if self.discovery.enabled {
            self.discovery_config()
                .validate()
                .map_err(|e| NodeError::ConfigError {
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

fn parse_kind<T>(name: &str) -> Result<T, NodeError>
where
    T: std::str::FromStr<Err = perch_relay::RelayError>,
{
    name.parse::<T>().map_err(|e| NodeError::ConfigError {
        reason: e.to_string(),
    })
}
