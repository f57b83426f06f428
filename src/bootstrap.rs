//! Initial peer discovery.
//!
//! Candidates come from fixed addresses in the configuration and from DNS
//! seeds whose records point at long-running nodes. Name resolution sits
//! behind [`Resolver`] so discovery can be exercised without a network.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{DnsSeed, NetworkConfig};
use crate::error::{ConfigError, TransportError};

/// A configured peer address, either literal or a name to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Addr(SocketAddr),
    Host { host: String, port: u16 },
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Addr(addr));
        }

        let invalid = |reason: &str| ConfigError::InvalidAddress {
            addr: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        if host.is_empty() || host.contains(':') {
            return Err(invalid("bad host"));
        }

        Ok(Endpoint::Host {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Addr(addr) => write!(f, "{addr}"),
            Endpoint::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Turns hostnames into IP addresses.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver via `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Resolver answering from a fixed table. Unknown names fail.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    results: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_result(&mut self, host: &str, ips: Vec<IpAddr>) {
        self.results.insert(host.to_string(), ips);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.results
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
    }
}

/// Produces stream-1 dial candidates.
pub struct Bootstrap<R> {
    static_nodes: Vec<Endpoint>,
    dns_seeds: Vec<DnsSeed>,
    resolver: R,
}

impl<R: Resolver> Bootstrap<R> {
    pub fn new(static_nodes: Vec<Endpoint>, dns_seeds: Vec<DnsSeed>, resolver: R) -> Self {
        Self {
            static_nodes,
            dns_seeds,
            resolver,
        }
    }

    pub fn from_config(config: &NetworkConfig, resolver: R) -> Result<Self, ConfigError> {
        let static_nodes = config
            .bootstrap_nodes
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Endpoint>, _>>()?;

        Ok(Self::new(static_nodes, config.dns_seeds.clone(), resolver))
    }

    /// Resolves every source into a deduplicated, shuffled candidate list.
    ///
    /// A source that fails to resolve is logged and skipped. Only when
    /// nothing at all resolves is this an error.
    pub async fn candidates(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        let mut push = |addr: SocketAddr| {
            if seen.insert(addr) {
                candidates.push(addr);
            }
        };

        for endpoint in &self.static_nodes {
            match endpoint {
                Endpoint::Addr(addr) => push(*addr),
                Endpoint::Host { host, port } => {
                    for ip in self.lookup(host).await {
                        push(SocketAddr::new(ip, *port));
                    }
                }
            }
        }

        for seed in &self.dns_seeds {
            let ips = self.lookup(&seed.host).await;
            debug!(seed = %seed.host, count = ips.len(), "dns seed resolved");
            for ip in ips {
                push(SocketAddr::new(ip, seed.port));
            }
        }

        if candidates.is_empty() {
            return Err(ConfigError::NoBootstrapAddresses);
        }

        candidates.shuffle(&mut rand::thread_rng());
        info!(count = candidates.len(), "bootstrap candidates");
        Ok(candidates)
    }

    async fn lookup(&self, host: &str) -> Vec<IpAddr> {
        match self.resolver.resolve(host).await {
            Ok(ips) => ips,
            Err(source) => {
                let err = TransportError::Resolve {
                    host: host.to_string(),
                    source,
                };
                warn!(error = %err, "skipping bootstrap source");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn seed(host: &str, port: u16) -> DnsSeed {
        DnsSeed {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "192.0.2.1:8444".parse::<Endpoint>().unwrap(),
            Endpoint::Addr("192.0.2.1:8444".parse().unwrap())
        );
        assert_eq!(
            "[2001:db8::1]:8444".parse::<Endpoint>().unwrap(),
            Endpoint::Addr("[2001:db8::1]:8444".parse().unwrap())
        );
        assert_eq!(
            "node.example.org:8080".parse::<Endpoint>().unwrap(),
            Endpoint::Host {
                host: "node.example.org".to_string(),
                port: 8080
            }
        );

        assert!("node.example.org".parse::<Endpoint>().is_err());
        assert!("node.example.org:http".parse::<Endpoint>().is_err());
        assert!(":8444".parse::<Endpoint>().is_err());
        assert!("2001:db8::1:8444:x".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_seed_and_static_nodes_combined() {
        let mut resolver = StaticResolver::new();
        resolver.add_result("seed.example.org", vec![ip(1, 2, 3, 4), ip(5, 6, 7, 8)]);

        let bootstrap = Bootstrap::new(
            vec!["9.9.9.9:8444".parse().unwrap()],
            vec![seed("seed.example.org", 8080)],
            resolver,
        );

        let mut candidates = bootstrap.candidates().await.unwrap();
        candidates.sort();

        let mut expected: Vec<SocketAddr> = vec![
            "1.2.3.4:8080".parse().unwrap(),
            "5.6.7.8:8080".parse().unwrap(),
            "9.9.9.9:8444".parse().unwrap(),
        ];
        expected.sort();
        assert_eq!(candidates, expected);
    }

    #[tokio::test]
    async fn test_failed_seed_is_skipped() {
        let mut resolver = StaticResolver::new();
        resolver.add_result("good.example.org", vec![ip(1, 1, 1, 1)]);

        let bootstrap = Bootstrap::new(
            vec![],
            vec![seed("bad.example.org", 8444), seed("good.example.org", 8444)],
            resolver,
        );

        assert_eq!(
            bootstrap.candidates().await.unwrap(),
            vec!["1.1.1.1:8444".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_duplicates_removed() {
        let mut resolver = StaticResolver::new();
        resolver.add_result("a.example.org", vec![ip(1, 1, 1, 1), ip(1, 1, 1, 1)]);
        resolver.add_result("b.example.org", vec![ip(1, 1, 1, 1)]);

        let bootstrap = Bootstrap::new(
            vec!["1.1.1.1:8444".parse().unwrap()],
            vec![seed("a.example.org", 8444), seed("b.example.org", 8444)],
            resolver,
        );

        assert_eq!(bootstrap.candidates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_resolved_is_an_error() {
        let bootstrap = Bootstrap::new(
            vec!["nowhere.example.org:8444".parse().unwrap()],
            vec![seed("bad.example.org", 8444)],
            StaticResolver::new(),
        );

        assert!(matches!(
            bootstrap.candidates().await,
            Err(ConfigError::NoBootstrapAddresses)
        ));
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_static_node() {
        let mut config = NetworkConfig::default();
        config.bootstrap_nodes = vec!["no-port".to_string()];

        assert!(Bootstrap::from_config(&config, StaticResolver::new()).is_err());
    }
}
