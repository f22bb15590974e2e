use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::errors::{MetadataError, SourceError};

use super::availability::{
    apply_read_only_targets, evaluate_group_quorum, evaluate_replica_set, ClusterAvailability,
    QuorumEvaluation, ReadOnlyTargets,
};
use super::metadata::{ClusterType, DeclaredTopology, MemberStatus, MetadataSource, TargetCluster};
use super::node::{ManagedInstance, NodeAddress};
use super::state::{ClusterTopology, ManagedCluster};

/// Runs refresh cycles against the metadata servers.
///
/// Holds the list of metadata servers in the order they should be tried.
/// The list is only reordered by [`MetadataReader::update_metadata_servers`],
/// after a refresh result has been committed.
pub(crate) struct MetadataReader {
    source: Arc<dyn MetadataSource>,
    target: TargetCluster,
    cluster_type: ClusterType,
    read_only_targets: ReadOnlyTargets,
    metadata_servers: Vec<NodeAddress>,
}

/// Result of one successful refresh cycle.
#[derive(Debug)]
pub(crate) struct FetchedTopology {
    pub(crate) topology: ClusterTopology,
    /// The metadata server the topology was read from.
    pub(crate) metadata_server: NodeAddress,
    /// Whether some member reported a quorum for the target cluster.
    pub(crate) have_quorum: bool,
}

impl FetchedTopology {
    fn is_writable(&self) -> bool {
        self.topology.target_availability() == ClusterAvailability::AvailableWritable
    }
}

impl MetadataReader {
    pub(crate) fn new(
        source: Arc<dyn MetadataSource>,
        target: TargetCluster,
        cluster_type: ClusterType,
        read_only_targets: ReadOnlyTargets,
        metadata_servers: Vec<NodeAddress>,
    ) -> Self {
        Self {
            source,
            target,
            cluster_type,
            read_only_targets,
            metadata_servers,
        }
    }

    pub(crate) fn metadata_servers(&self) -> &[NodeAddress] {
        &self.metadata_servers
    }

    /// Reads the topology of the target cluster from the first metadata server that knows it.
    ///
    /// With `want_writable`, a server whose view of the cluster has no writable
    /// member is not final: the next server is asked, and the first result is
    /// used only if no server sees a writable member.
    pub(crate) async fn fetch_cluster_topology(
        &self,
        want_writable: bool,
        cached_view_id: u64,
    ) -> Result<FetchedTopology, MetadataError> {
        // The list may be reordered only after this cycle is committed, so iterate a copy.
        let servers = self.metadata_servers.clone();

        let mut reached_any = false;
        let mut last_connect_error: Option<SourceError> = None;
        let mut last_error: Option<MetadataError> = None;
        let mut fallback: Option<FetchedTopology> = None;

        for server in &servers {
            let mut session = match self.source.connect(server).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(
                        metadata_server = %server,
                        error = %err,
                        "Failed to connect to metadata server"
                    );
                    last_connect_error = Some(err);
                    continue;
                }
            };
            reached_any = true;

            let declared = match session.fetch_declared_topology().await {
                Ok(Some(declared)) => declared,
                Ok(None) => {
                    debug!("Metadata server {} holds no metadata, trying the next one", server);
                    last_error = Some(MetadataError::ClusterNotFound(self.target.to_string()));
                    continue;
                }
                Err(err) => {
                    warn!(
                        metadata_server = %server,
                        error = %err,
                        "Failed to fetch metadata"
                    );
                    last_error = Some(err.into());
                    continue;
                }
            };
            drop(session);

            let target_idx = match self.check_declared_topology(&declared, cached_view_id) {
                Ok(idx) => idx,
                Err(err) => {
                    warn!(
                        metadata_server = %server,
                        error = %err,
                        "Skipping metadata server"
                    );
                    last_error = Some(err);
                    continue;
                }
            };

            let fetched = self
                .determine_availability(declared, target_idx, server.clone())
                .await;

            if !want_writable || fetched.is_writable() {
                return Ok(fetched);
            }
            debug!(
                "Metadata server {} sees no writable member of cluster {}, trying the next one",
                server, self.target
            );
            if fallback.is_none() {
                fallback = Some(fetched);
            }
        }

        if let Some(fetched) = fallback {
            return Ok(fetched);
        }

        Err(if reached_any {
            last_error.unwrap_or_else(|| MetadataError::ClusterNotFound(self.target.to_string()))
        } else {
            MetadataError::NoMetadataServerReached {
                addresses: servers,
                last_error: last_connect_error,
            }
        })
    }

    /// Makes sure the declared topology describes the target cluster, with the expected
    /// type and a view that is not older than the cached one.
    fn check_declared_topology(
        &self,
        declared: &DeclaredTopology,
        cached_view_id: u64,
    ) -> Result<usize, MetadataError> {
        let target_idx = declared
            .find_cluster(&self.target)
            .ok_or_else(|| MetadataError::ClusterNotFound(self.target.to_string()))?;

        if declared.cluster_type != self.cluster_type {
            return Err(MetadataError::InvalidClusterType {
                expected: self.cluster_type,
                found: declared.cluster_type,
            });
        }

        if declared.view_id < cached_view_id {
            return Err(MetadataError::OutdatedView { cached_view_id });
        }

        Ok(target_idx)
    }

    /// Asks the members of the target cluster, in turn, for the live state of the cluster.
    ///
    /// Stops at the first member whose report yields a quorum: there can be only one.
    async fn determine_availability(
        &self,
        declared: DeclaredTopology,
        target_idx: usize,
        metadata_server: NodeAddress,
    ) -> FetchedTopology {
        let DeclaredTopology {
            view_id,
            mut clusters,
            ..
        } = declared;

        let mut have_quorum = false;
        if let Some(cluster) = clusters.get_mut(target_idx) {
            have_quorum = self.evaluate_cluster(cluster).await;
            apply_read_only_targets(&mut cluster.members, self.read_only_targets);
        }

        let mut topology = ClusterTopology {
            writable_server: clusters
                .get(target_idx)
                .and_then(|cluster| cluster.writable_members().next())
                .map(|member| member.address.clone()),
            clusters,
            target_cluster: Some(target_idx),
            metadata_servers: self.metadata_servers.clone(),
            view_id,
        };
        if let Some(servers) = topology.preferred_metadata_servers() {
            topology.metadata_servers = servers;
        }

        FetchedTopology {
            topology,
            metadata_server,
            have_quorum,
        }
    }

    async fn evaluate_cluster(&self, cluster: &mut ManagedCluster) -> bool {
        let candidates: Vec<NodeAddress> = cluster
            .members
            .iter()
            .filter(|member| !member.is_read_replica())
            .map(|member| member.address.clone())
            .collect();

        let mut evaluated: Option<(Vec<ManagedInstance>, QuorumEvaluation)> = None;
        for candidate in candidates {
            let report = match self.fetch_live_member_report(&candidate).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        member = %candidate,
                        error = %err,
                        "Failed to fetch live member report"
                    );
                    continue;
                }
            };

            let mut members = cluster.members.clone();
            let evaluation = match self.cluster_type {
                ClusterType::GroupReplication => evaluate_group_quorum(&mut members, &report),
                ClusterType::ReplicaSet => evaluate_replica_set(&mut members, &report),
            };
            debug!(
                member = %candidate,
                quorum_count = evaluation.quorum_count,
                total_reported = evaluation.total_reported,
                have_quorum = evaluation.have_quorum,
                "Evaluated live member report"
            );
            if evaluation.metadata_discrepancy {
                warn!(
                    "Member {} reports group members that are not declared in the metadata: {}",
                    candidate,
                    undeclared_members(&cluster.members, &report).format(", ")
                );
            }

            let have_quorum = evaluation.have_quorum;
            evaluated = Some((members, evaluation));
            if have_quorum {
                break;
            }
        }

        match evaluated {
            Some((members, evaluation)) => {
                cluster.members = members;
                cluster.availability = evaluation.availability;
                cluster.metadata_discrepancy = evaluation.metadata_discrepancy;
                evaluation.have_quorum
            }
            None => {
                warn!(
                    "Unable to fetch the live state of cluster {} from any of its members",
                    self.target
                );
                cluster.availability = ClusterAvailability::Unavailable;
                false
            }
        }
    }

    async fn fetch_live_member_report(
        &self,
        member: &NodeAddress,
    ) -> Result<Vec<MemberStatus>, SourceError> {
        let mut session = self.source.connect(member).await?;
        session.fetch_live_member_report().await
    }

    /// Adopts the metadata server order of a committed topology for the next cycles.
    pub(crate) fn update_metadata_servers(&mut self, topology: &ClusterTopology) {
        if topology.metadata_servers.is_empty() || topology.metadata_servers == self.metadata_servers {
            return;
        }
        debug!(
            "Metadata servers for the next refresh: {}",
            topology.metadata_servers.iter().format(", ")
        );
        self.metadata_servers = topology.metadata_servers.clone();
    }
}

fn undeclared_members<'a>(
    declared: &'a [ManagedInstance],
    report: &'a [MemberStatus],
) -> impl Iterator<Item = String> + 'a {
    report
        .iter()
        .filter(|status| !declared.iter().any(|member| member.id == status.member_id))
        .map(|status| match &status.address {
            Some(address) => address.to_string(),
            None => status.member_id.to_string(),
        })
}
