use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::Endpoint;
use crate::error::ConfigError;
use crate::session::HandshakeConfig;
use crate::wire::constants::{DEFAULT_PORT, MAX_PAYLOAD_LEN, STREAM_ONE, USER_AGENT};
use crate::wire::message::Services;

/// Node configuration, read from a TOML file. Every field has a default, so
/// an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub peers: PeersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Fixed peers, `ip:port` or `host:port`.
    pub bootstrap_nodes: Vec<String>,
    pub dns_seeds: Vec<DnsSeed>,
    pub streams: Vec<u32>,
    pub max_payload_len: u32,
    pub user_agent: String,
}

/// A hostname whose A/AAAA records are bootstrap peers listening on `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSeed {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// A peer contacted within this window is not dialed again.
    pub retry_cooldown_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Unconnected peers not re-advertised for this long are forgotten.
    pub forget_after_secs: u64,
    /// Zero disables periodic re-bootstrap.
    pub rebootstrap_interval_secs: u64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            bootstrap_nodes: Vec::new(),
            dns_seeds: vec![
                DnsSeed {
                    host: "bootstrap8080.bitmessage.org".to_string(),
                    port: 8080,
                },
                DnsSeed {
                    host: "bootstrap8444.bitmessage.org".to_string(),
                    port: 8444,
                },
            ],
            streams: vec![STREAM_ONE],
            max_payload_len: MAX_PAYLOAD_LEN,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            retry_cooldown_secs: 5 * 60,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 20,
            forget_after_secs: 3 * 60 * 60,
            rebootstrap_interval_secs: 30 * 60,
            prune_interval_secs: 10 * 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: NodeConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if self.network.streams.is_empty() || self.network.streams.contains(&0) {
            return Err(ConfigError::NoStreams);
        }

        for node in &self.network.bootstrap_nodes {
            node.parse::<Endpoint>()?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
                addr: self.network.listen_addr.clone(),
                reason: e.to_string(),
            })
    }

    /// Parameters every session announces.
    pub fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            streams: self.network.streams.clone(),
            user_agent: self.network.user_agent.clone(),
            services: Services::NODE_NETWORK,
            max_payload_len: self.network.max_payload_len,
            listen_port: self.listen_addr().map_or(DEFAULT_PORT, |a| a.port()),
        }
    }
}

impl PeersConfig {
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn forget_after(&self) -> Duration {
        Duration::from_secs(self.forget_after_secs)
    }

    pub fn rebootstrap_interval(&self) -> Option<Duration> {
        (self.rebootstrap_interval_secs > 0)
            .then(|| Duration::from_secs(self.rebootstrap_interval_secs))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}
