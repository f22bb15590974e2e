//! The seam between the control plane and the database holding the cluster metadata.
//!
//! The control plane never constructs queries. A [`MetadataSource`] opens
//! [`MetadataSession`]s to metadata servers and cluster members, and the
//! sessions answer two questions in structured form:
//! - what does the metadata declare about the cluster ([`DeclaredTopology`]),
//! - what does the replication group currently report about its members ([`MemberStatus`]).

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::SourceError;

use super::node::{MemberRole, NodeAddress};
use super::state::ManagedCluster;

/// Identifies the cluster the router serves.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TargetCluster {
    /// Cluster identified by its name.
    Name(String),
    /// Cluster identified by its id.
    Id(String),
}

impl TargetCluster {
    pub(crate) fn matches(&self, cluster: &ManagedCluster) -> bool {
        match self {
            TargetCluster::Name(name) => cluster.name == *name,
            TargetCluster::Id(id) => cluster.id == *id,
        }
    }
}

impl std::fmt::Display for TargetCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetCluster::Name(name) => write!(f, "'{name}'"),
            TargetCluster::Id(id) => write!(f, "id={id}"),
        }
    }
}

/// Kind of cluster described by the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[non_exhaustive]
pub enum ClusterType {
    /// A replication group with quorum-based membership.
    GroupReplication,
    /// An asynchronously replicated replica set.
    ReplicaSet,
}

/// Cluster topology as declared by one metadata server.
#[derive(Debug, Clone)]
pub struct DeclaredTopology {
    /// Type of the described clusters.
    pub cluster_type: ClusterType,
    /// Version of the metadata; must never go backwards.
    pub view_id: u64,
    /// Clusters known to the metadata server. Their members carry the declared
    /// data only: mode and role are `Unavailable` until live state is known.
    pub clusters: Vec<ManagedCluster>,
}

/// State of a replication group member, as reported by the group itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemberState {
    /// The member is serving.
    Online,
    /// The member is catching up with the group.
    Recovering,
    /// The member left the group.
    Offline,
    /// The member is in an error state.
    Error,
    /// The group lost contact with the member.
    Unreachable,
}

impl MemberState {
    /// Members that are online or recovering count towards the quorum.
    pub fn participates_in_quorum(self) -> bool {
        matches!(self, MemberState::Online | MemberState::Recovering)
    }
}

/// One entry of a live health report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    /// Server UUID of the member.
    pub member_id: Uuid,
    /// Address the member advertises.
    pub address: Option<NodeAddress>,
    /// Current state of the member.
    pub state: MemberState,
    /// Current role of the member.
    pub role: MemberRole,
}

/// A connection to one metadata server or cluster member.
#[async_trait]
pub trait MetadataSession: Send {
    /// Reads the declared topology from the metadata stored on this server.
    ///
    /// `Ok(None)` means the server holds no metadata at all; this, as well as
    /// a topology not mentioning the target cluster, makes the refresh cycle
    /// move on to the next candidate server.
    async fn fetch_declared_topology(&mut self) -> Result<Option<DeclaredTopology>, SourceError>;

    /// Reads the replication group's live view of its members, as seen by this server.
    async fn fetch_live_member_report(&mut self) -> Result<Vec<MemberStatus>, SourceError>;
}

/// Opens sessions to metadata servers and cluster members.
///
/// Implementations must not block indefinitely: every call is expected to
/// finish (successfully or not) within the source's own connect/read timeouts.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Connects to the given server and authenticates.
    async fn connect(&self, server: &NodeAddress) -> Result<Box<dyn MetadataSession>, SourceError>;
}

impl DeclaredTopology {
    pub(crate) fn find_cluster(&self, target: &TargetCluster) -> Option<usize> {
        self.clusters
            .iter()
            .position(|cluster| target.matches(cluster))
    }
}

