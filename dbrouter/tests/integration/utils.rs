use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dbrouter::cluster::{NodeAddress, TargetCluster, TopologyCache, TopologyCacheConfig};
use dbrouter::test_utils::{mock_address, MockMetadataSource};
use tokio::net::TcpListener;

#[cfg(test)]
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Starts a cache of cluster "prod" bootstrapping from the given mock hosts.
/// Refreshes happen only on request.
pub(crate) fn start_cache(source: &Arc<MockMetadataSource>, metadata_hosts: &[&str]) -> TopologyCache {
    start_cache_with(source, metadata_hosts, |config| config)
}

pub(crate) fn start_cache_with(
    source: &Arc<MockMetadataSource>,
    metadata_hosts: &[&str],
    configure: impl FnOnce(TopologyCacheConfig) -> TopologyCacheConfig,
) -> TopologyCache {
    let servers = metadata_hosts.iter().map(|host| mock_address(host)).collect();
    let config = TopologyCacheConfig::new(TargetCluster::Name("prod".to_owned()), servers)
        .with_ttl(Duration::from_secs(3600));
    TopologyCache::start(configure(config), source.clone())
}

pub(crate) fn node_address(addr: SocketAddr) -> NodeAddress {
    NodeAddress::new(addr.ip().to_string(), addr.port()).unwrap()
}

/// A local listening socket; connections to it succeed as long as it is alive.
pub(crate) async fn listening_destination() -> (TcpListener, NodeAddress) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = node_address(listener.local_addr().unwrap());
    (listener, address)
}

/// A local address nothing listens on.
pub(crate) async fn closed_destination() -> NodeAddress {
    let (_listener, address) = listening_destination().await;
    address
}
