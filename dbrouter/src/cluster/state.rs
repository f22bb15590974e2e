use itertools::Itertools;

use super::availability::ClusterAvailability;
use super::node::{ManagedInstance, NodeAddress, ServerMode};

/// One cluster described by the metadata, together with the live state of its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCluster {
    /// Id of the cluster, as stored in the metadata.
    pub id: String,
    /// Name of the cluster.
    pub name: String,
    /// Members of the cluster, in metadata order.
    pub members: Vec<ManagedInstance>,
    /// Whether the cluster runs with a single writable member.
    pub single_primary_mode: bool,
    /// Whether this is the primary cluster of a multi-cluster topology.
    pub is_primary: bool,
    /// Whether this cluster was invalidated within a multi-cluster topology.
    pub is_invalidated: bool,
    /// Set when the replication group reports members absent from the metadata.
    pub metadata_discrepancy: bool,
    /// Availability classification computed during the last refresh.
    pub availability: ClusterAvailability,
}

impl ManagedCluster {
    /// Creates a cluster with the given members; live state is not known yet.
    pub fn new(id: impl Into<String>, name: impl Into<String>, members: Vec<ManagedInstance>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members,
            single_primary_mode: true,
            is_primary: true,
            is_invalidated: false,
            metadata_discrepancy: false,
            availability: ClusterAvailability::Unavailable,
        }
    }

    /// Returns the writable members of the cluster.
    pub fn writable_members(&self) -> impl Iterator<Item = &ManagedInstance> + '_ {
        self.members.iter().filter(|member| member.is_writable())
    }
}

/// Snapshot of the topology of the monitored clusters.
///
/// It is immutable after creation, and is replaced atomically upon a metadata refresh.
/// Readers obtain it through [`TopologyHandle::topology`](super::TopologyHandle::topology)
/// and never observe a half-updated member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    /// All clusters described by the metadata.
    pub clusters: Vec<ManagedCluster>,
    /// Index of the cluster the router serves in `clusters`.
    pub target_cluster: Option<usize>,
    /// Metadata servers, in the order the next refresh will try them.
    /// Invariant: never empty.
    pub metadata_servers: Vec<NodeAddress>,
    /// Version of the metadata this snapshot was built from. Never decreases.
    pub view_id: u64,
    /// Metadata server known to be writable, if any.
    pub writable_server: Option<NodeAddress>,
}

impl ClusterTopology {
    /// Topology known before the first successful refresh: only the bootstrap metadata servers.
    pub(crate) fn initial(metadata_servers: Vec<NodeAddress>) -> Self {
        Self {
            clusters: Vec::new(),
            target_cluster: None,
            metadata_servers,
            view_id: 0,
            writable_server: None,
        }
    }

    /// The cluster the router serves, if it is known.
    pub fn target(&self) -> Option<&ManagedCluster> {
        self.target_cluster.and_then(|idx| self.clusters.get(idx))
    }

    /// Members of the target cluster; empty if the target is not known.
    pub fn target_members(&self) -> &[ManagedInstance] {
        self.target()
            .map(|cluster| cluster.members.as_slice())
            .unwrap_or_default()
    }

    /// Availability of the target cluster.
    pub fn target_availability(&self) -> ClusterAvailability {
        self.target()
            .map(|cluster| cluster.availability)
            .unwrap_or(ClusterAvailability::Unavailable)
    }

    /// Compares the member lists (including the live state of each member) of two snapshots.
    pub fn same_members(&self, other: &ClusterTopology) -> bool {
        self.clusters.len() == other.clusters.len()
            && self
                .clusters
                .iter()
                .zip(other.clusters.iter())
                .all(|(a, b)| a.members == b.members)
    }

    /// Copy of this snapshot with every member dropped.
    ///
    /// Used when no metadata server is reachable: the routing information is
    /// suspect, but the metadata servers and the view id are kept, so the next
    /// refresh knows where to look and the view id stays monotonic.
    pub(crate) fn without_members(&self) -> Self {
        Self {
            clusters: self
                .clusters
                .iter()
                .map(|cluster| ManagedCluster {
                    members: Vec::new(),
                    availability: ClusterAvailability::Unavailable,
                    ..cluster.clone()
                })
                .collect(),
            writable_server: None,
            ..self.clone()
        }
    }

    /// Metadata servers derived from the member lists, ordered for the next refresh:
    /// writable members first, then read-only ones, then the rest.
    ///
    /// Read replicas never hold authoritative metadata and are left out.
    /// Returns `None` if no member qualifies.
    pub(crate) fn preferred_metadata_servers(&self) -> Option<Vec<NodeAddress>> {
        let servers: Vec<NodeAddress> = self
            .clusters
            .iter()
            .flat_map(|cluster| cluster.members.iter())
            .filter(|member| !member.is_read_replica())
            .sorted_by_key(|member| match member.mode {
                ServerMode::ReadWrite => 0,
                ServerMode::ReadOnly => 1,
                ServerMode::Unavailable => 2,
            })
            .map(|member| member.address.clone())
            .unique()
            .collect();

        (!servers.is_empty()).then_some(servers)
    }
}
