//! Scripted [`MetadataSource`] and other doubles for tests.
//!
//! Hosts are identified by name; every address uses port 3306. A host answers
//! connections if it was given metadata or a live member report, and it has
//! not been marked unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cluster::metadata::{
    ClusterType, DeclaredTopology, MemberState, MemberStatus, MetadataSession, MetadataSource,
};
use crate::cluster::{InstanceType, ManagedCluster, ManagedInstance, MemberRole, NodeAddress};
use crate::errors::SourceError;
use crate::policies::listeners::SocketAcceptor;
use crate::quarantine::QuarantineRoute;
use crate::utils::MutexExt;

/// Port of every mock host.
pub const MOCK_PORT: u16 = 3306;

#[cfg(test)]
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Builds a group replication cluster whose members live on the given hosts.
pub fn group_cluster(name: &str, hosts: &[&str]) -> ManagedCluster {
    let members = hosts
        .iter()
        .map(|host| {
            ManagedInstance::new(
                Uuid::new_v4(),
                InstanceType::GroupMember,
                mock_address(host),
            )
        })
        .collect();
    ManagedCluster::new(format!("{name}-id"), name, members)
}

/// Address of a mock host.
pub fn mock_address(host: &str) -> NodeAddress {
    match NodeAddress::new(host, MOCK_PORT) {
        Ok(address) => address,
        Err(err) => panic!("invalid mock host {host}: {err}"),
    }
}

#[derive(Default, Clone)]
struct MockHost {
    metadata: Option<DeclaredTopology>,
    report: Option<Vec<MemberStatus>>,
    unreachable: bool,
}

/// A [`MetadataSource`] answering from scripted per-host state.
#[derive(Default)]
pub struct MockMetadataSource {
    hosts: Mutex<HashMap<String, MockHost>>,
    connections: AtomicUsize,
}

impl MockMetadataSource {
    /// Creates a source without any host.
    pub fn new() -> Self {
        Self::default()
    }

    fn update_host(&self, host: &str, update: impl FnOnce(&mut MockHost)) {
        let mut hosts = self.hosts.lock_unpoisoned();
        update(hosts.entry(host.to_owned()).or_default());
    }

    /// Makes `host` a metadata server declaring the given group replication clusters.
    pub fn set_metadata(&self, host: &str, view_id: u64, clusters: Vec<ManagedCluster>) {
        self.set_metadata_of_type(host, ClusterType::GroupReplication, view_id, clusters);
    }

    /// Makes `host` a metadata server declaring clusters of the given type.
    pub fn set_metadata_of_type(
        &self,
        host: &str,
        cluster_type: ClusterType,
        view_id: u64,
        clusters: Vec<ManagedCluster>,
    ) {
        self.update_host(host, |mock| {
            mock.metadata = Some(DeclaredTopology {
                cluster_type,
                view_id,
                clusters,
            })
        });
    }

    /// Makes `host` reachable, but holding no metadata.
    pub fn set_empty_metadata(&self, host: &str) {
        self.update_host(host, |mock| mock.metadata = None);
    }

    /// Sets the live member report `host` returns.
    pub fn set_report(&self, host: &str, report: Vec<MemberStatus>) {
        self.update_host(host, |mock| mock.report = Some(report));
    }

    /// Every member of the cluster reports all members online, with `primary` as the primary.
    pub fn set_primary(&self, cluster: &ManagedCluster, primary: &str) {
        self.set_primaries(cluster, &[primary]);
    }

    /// Every member of the cluster reports all members online, with `primaries` as the
    /// primaries of a multi-primary group.
    pub fn set_primaries(&self, cluster: &ManagedCluster, primaries: &[&str]) {
        let report = all_online(cluster, primaries);
        for member in &cluster.members {
            self.set_report(member.address.host(), report.clone());
        }
    }

    /// `observer` reports all members online, with `primary` as the primary.
    pub fn set_primary_as_seen_by(&self, cluster: &ManagedCluster, observer: &str, primary: &str) {
        self.set_report(observer, all_online(cluster, &[primary]));
    }

    /// Every member of the cluster reports all members online as secondaries.
    pub fn set_all_secondaries(&self, cluster: &ManagedCluster) {
        let report: Vec<MemberStatus> = cluster
            .members
            .iter()
            .map(|member| online(member, MemberRole::Secondary))
            .collect();
        for member in &cluster.members {
            self.set_report(member.address.host(), report.clone());
        }
    }

    /// Makes `host` refuse (or accept again) connections.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.update_host(host, |mock| mock.unreachable = unreachable);
    }

    /// Makes every member of the cluster refuse (or accept again) connections.
    pub fn set_cluster_unreachable(&self, cluster: &ManagedCluster, unreachable: bool) {
        for member in &cluster.members {
            self.set_unreachable(member.address.host(), unreachable);
        }
    }

    /// Number of successful connections so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn all_online(cluster: &ManagedCluster, primaries: &[&str]) -> Vec<MemberStatus> {
    cluster
        .members
        .iter()
        .map(|member| {
            let role = if primaries.contains(&member.address.host()) {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            };
            online(member, role)
        })
        .collect()
}

fn online(member: &ManagedInstance, role: MemberRole) -> MemberStatus {
    MemberStatus {
        member_id: member.id,
        address: Some(member.address.clone()),
        state: MemberState::Online,
        role,
    }
}

struct MockSession(MockHost);

#[async_trait]
impl MetadataSession for MockSession {
    async fn fetch_declared_topology(&mut self) -> Result<Option<DeclaredTopology>, SourceError> {
        Ok(self.0.metadata.clone())
    }

    async fn fetch_live_member_report(&mut self) -> Result<Vec<MemberStatus>, SourceError> {
        self.0
            .report
            .clone()
            .ok_or_else(|| SourceError::Query("replication group is not running".to_owned()))
    }
}

#[async_trait]
impl MetadataSource for MockMetadataSource {
    async fn connect(&self, server: &NodeAddress) -> Result<Box<dyn MetadataSession>, SourceError> {
        let host = self
            .hosts
            .lock_unpoisoned()
            .get(server.host())
            .filter(|host| !host.unreachable)
            .cloned();
        match host {
            Some(host) => {
                self.connections.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockSession(host)))
            }
            None => Err(SourceError::Connection {
                address: server.clone(),
                reason: "Connection refused".to_owned(),
            }),
        }
    }
}

/// Polls `condition` every 10 ms until it holds.
///
/// Meant to be used under a test timeout.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A [`QuarantineRoute`] with a fixed destination list, counting how often
/// it was told to start and stop accepting.
#[derive(Debug, Default)]
pub struct RecordingRoute {
    destinations: Mutex<Vec<NodeAddress>>,
    acceptor: RecordingAcceptor,
}

impl RecordingRoute {
    /// Creates a route with the given destinations.
    pub fn new(destinations: Vec<NodeAddress>) -> Self {
        Self {
            destinations: Mutex::new(destinations),
            acceptor: RecordingAcceptor::default(),
        }
    }

    /// Replaces the destinations of the route.
    pub fn set_destinations(&self, destinations: Vec<NodeAddress>) {
        *self.destinations.lock_unpoisoned() = destinations;
    }

    /// Number of `start_accepting` calls so far.
    pub fn starts(&self) -> usize {
        self.acceptor.starts()
    }

    /// Number of `stop_accepting` calls so far.
    pub fn stops(&self) -> usize {
        self.acceptor.stops()
    }
}

impl QuarantineRoute for RecordingRoute {
    fn destination_addresses(&self) -> Vec<NodeAddress> {
        self.destinations.lock_unpoisoned().clone()
    }

    fn start_accepting(&self) -> bool {
        self.acceptor.start_accepting()
    }

    fn stop_accepting(&self) {
        self.acceptor.stop_accepting()
    }
}

/// A [`SocketAcceptor`] counting calls, which can be made to fail starting.
#[derive(Debug, Default)]
pub struct RecordingAcceptor {
    starts: AtomicUsize,
    stops: AtomicUsize,
    accepting: AtomicBool,
    fail_start: AtomicBool,
}

impl RecordingAcceptor {
    /// Creates an acceptor which is not accepting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the following `start_accepting` calls fail (or succeed again).
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Number of `start_accepting` calls so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop_accepting` calls so far.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether the last successful call started accepting.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

impl SocketAcceptor for RecordingAcceptor {
    fn start_accepting(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return false;
        }
        self.accepting.store(true, Ordering::SeqCst);
        true
    }

    fn stop_accepting(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.accepting.store(false, Ordering::SeqCst);
    }
}
