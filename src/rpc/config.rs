use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use crate::common::{Id, ID_SIZE, MAX_BUCKET_SIZE_K};

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

/// Default maximum number of simultaneously inflight queries.
pub const DEFAULT_CONCURRENCY: usize = 16;

pub const DEFAULT_PORT: u16 = 6881;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
/// Rpc Configurations
pub struct Config {
    /// This node's id.
    ///
    /// Defaults to None, where a random id of `id_length` bytes is generated.
    pub id: Option<Id>,
    /// Length in bytes of every node id.
    ///
    /// Defaults to [ID_SIZE]
    pub id_length: usize,
    /// Bucket size of the routing table, and the number of closest contacts
    /// a lookup converges on.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum number of simultaneously inflight queries.
    ///
    /// Defaults to [DEFAULT_CONCURRENCY]
    pub concurrency: usize,
    /// Maximum number of simultaneously inflight queries sent by background
    /// lookups, see [Rpc::populate](super::Rpc::populate).
    ///
    /// Defaults to None, where a quarter of `concurrency` is used.
    pub background_concurrency: Option<usize>,
    /// Bootstrap nodes
    ///
    /// Defaults to None, where [DEFAULT_BOOTSTRAP_NODES] are resolved.
    /// An empty vector disables bootstrapping.
    pub bootstrap: Option<Vec<SocketAddr>>,
    /// IP address to listen on.
    ///
    /// Defaults to None, where `0.0.0.0` is used.
    pub ip: Option<IpAddr>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where [DEFAULT_PORT] is tried first,
    /// falling back to any available port.
    pub port: Option<u16>,
    /// UDP socket request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            id_length: ID_SIZE,
            k: MAX_BUCKET_SIZE_K,
            concurrency: DEFAULT_CONCURRENCY,
            background_concurrency: None,
            bootstrap: None,
            ip: None,
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Config {
    /// The background ceiling, never zero so background lookups can make progress.
    pub fn background_concurrency(&self) -> usize {
        self.background_concurrency
            .unwrap_or((self.concurrency / 4).max(1))
    }

    /// Explicit bootstrap nodes, or the resolved [DEFAULT_BOOTSTRAP_NODES].
    pub fn bootstrap(&self) -> Vec<SocketAddr> {
        match &self.bootstrap {
            Some(bootstrap) => bootstrap.clone(),
            None => to_socket_address(&DEFAULT_BOOTSTRAP_NODES),
        }
    }

    pub(crate) fn ip(&self) -> IpAddr {
        self.ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// Resolve `host:port` strings, skipping the ones that fail to resolve.
pub fn to_socket_address<T: AsRef<str>>(bootstrap: &[T]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .filter_map(|s| {
            s.as_ref()
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn background_concurrency_defaults_to_a_quarter() {
        let config = Config::default();
        assert_eq!(config.background_concurrency(), 4);

        let config = Config {
            concurrency: 2,
            ..Default::default()
        };
        assert_eq!(config.background_concurrency(), 1);

        let config = Config {
            background_concurrency: Some(7),
            ..Default::default()
        };
        assert_eq!(config.background_concurrency(), 7);
    }

    #[test]
    fn explicit_bootstrap() {
        let config = Config {
            bootstrap: Some(vec![]),
            ..Default::default()
        };
        assert!(config.bootstrap().is_empty());

        assert_eq!(
            to_socket_address(&["127.0.0.1:6881", "not an address"]),
            vec![SocketAddr::from(([127, 0, 0, 1], 6881))]
        );
    }
}
