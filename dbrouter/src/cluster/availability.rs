//! Quorum arithmetic and availability classification of a cluster.

use std::collections::HashSet;

use uuid::Uuid;

use super::metadata::{MemberState, MemberStatus};
use super::node::{InstanceType, ManagedInstance, MemberRole, ServerMode};

/// Availability of a cluster, as determined from a live health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClusterAvailability {
    /// Quorum is held and there is at least one writable member.
    AvailableWritable,
    /// Quorum is held, but no member is writable.
    AvailableReadOnly,
    /// Quorum is held, but every participating member is still recovering.
    /// Not routable, but kept apart from [`ClusterAvailability::Unavailable`].
    UnavailableRecovering,
    /// No quorum.
    Unavailable,
}

impl ClusterAvailability {
    /// Returns true if the cluster can serve traffic.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            ClusterAvailability::AvailableWritable | ClusterAvailability::AvailableReadOnly
        )
    }
}

/// Which instances may serve read-only traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum ReadOnlyTargets {
    /// Secondaries of the replication group only; read replicas are ignored.
    #[default]
    Secondaries,
    /// Read replicas only; read-only group members are ignored.
    ReadReplicas,
    /// Both secondaries and read replicas.
    All,
}

/// Outcome of evaluating one live health report against the declared members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QuorumEvaluation {
    /// Reported members that are declared in the metadata and participate (online or recovering).
    pub(crate) quorum_count: usize,
    /// Number of members in the live report, declared or not.
    pub(crate) total_reported: usize,
    pub(crate) have_quorum: bool,
    pub(crate) availability: ClusterAvailability,
    /// The live report mentions members the metadata does not know about.
    pub(crate) metadata_discrepancy: bool,
}

/// Assigns mode and role to every declared member from a replication group's live report,
/// and classifies the cluster.
///
/// Members reported by the group but missing from the metadata count towards
/// the denominator only, which makes quorum harder to reach when the metadata
/// and the group have drifted apart.
pub(crate) fn evaluate_group_quorum(
    members: &mut [ManagedInstance],
    report: &[MemberStatus],
) -> QuorumEvaluation {
    let declared: HashSet<Uuid> = members.iter().map(|member| member.id).collect();

    let total_reported = report.len();
    let quorum_count = report
        .iter()
        .filter(|status| declared.contains(&status.member_id) && status.state.participates_in_quorum())
        .count();
    let have_quorum = 2 * quorum_count > total_reported;
    let metadata_discrepancy = report
        .iter()
        .any(|status| !declared.contains(&status.member_id));

    let mut online_count = 0;
    for member in members.iter_mut() {
        let status = report.iter().find(|status| status.member_id == member.id);
        let (mode, role) = match (member.instance_type, status) {
            (InstanceType::ReadReplica, _) if have_quorum => {
                (ServerMode::ReadOnly, MemberRole::Secondary)
            }
            (InstanceType::ReadReplica, _) => (ServerMode::Unavailable, MemberRole::Unavailable),
            (_, Some(status)) if status.state == MemberState::Online => {
                online_count += 1;
                live_mode_and_role(status.role)
            }
            _ => (ServerMode::Unavailable, MemberRole::Unavailable),
        };
        member.mode = mode;
        member.role = role;
    }

    if !have_quorum {
        // Without a quorum nothing the group says about roles can be trusted.
        for member in members.iter_mut() {
            member.mode = ServerMode::Unavailable;
            member.role = MemberRole::Unavailable;
        }
    }

    let availability = if !have_quorum {
        ClusterAvailability::Unavailable
    } else if online_count == 0 {
        ClusterAvailability::UnavailableRecovering
    } else if members.iter().any(ManagedInstance::is_writable) {
        ClusterAvailability::AvailableWritable
    } else {
        ClusterAvailability::AvailableReadOnly
    };

    QuorumEvaluation {
        quorum_count,
        total_reported,
        have_quorum,
        availability,
        metadata_discrepancy,
    }
}

/// Assigns mode and role to the members of an asynchronously replicated replica set.
///
/// A replica set has no quorum: the report is taken from one member's view,
/// and the set is available as long as some member is online.
pub(crate) fn evaluate_replica_set(
    members: &mut [ManagedInstance],
    report: &[MemberStatus],
) -> QuorumEvaluation {
    let mut online_count = 0;
    for member in members.iter_mut() {
        let status = report
            .iter()
            .find(|status| status.member_id == member.id && status.state == MemberState::Online);
        let (mode, role) = match status {
            Some(status) => {
                online_count += 1;
                live_mode_and_role(status.role)
            }
            None => (ServerMode::Unavailable, MemberRole::Unavailable),
        };
        member.mode = mode;
        member.role = role;
    }

    let availability = if online_count == 0 {
        ClusterAvailability::Unavailable
    } else if members.iter().any(ManagedInstance::is_writable) {
        ClusterAvailability::AvailableWritable
    } else {
        ClusterAvailability::AvailableReadOnly
    };

    QuorumEvaluation {
        quorum_count: online_count,
        total_reported: report.len(),
        have_quorum: online_count > 0,
        availability,
        metadata_discrepancy: false,
    }
}

fn live_mode_and_role(role: MemberRole) -> (ServerMode, MemberRole) {
    match role {
        MemberRole::Primary => (ServerMode::ReadWrite, MemberRole::Primary),
        MemberRole::Secondary => (ServerMode::ReadOnly, MemberRole::Secondary),
        MemberRole::Unavailable => (ServerMode::Unavailable, MemberRole::Unavailable),
    }
}

/// Flags the read-only instances the configuration excludes from routing.
pub(crate) fn apply_read_only_targets(members: &mut [ManagedInstance], targets: ReadOnlyTargets) {
    for member in members.iter_mut() {
        member.ignore = match targets {
            ReadOnlyTargets::All => false,
            ReadOnlyTargets::Secondaries => member.is_read_replica(),
            ReadOnlyTargets::ReadReplicas => {
                !member.is_read_replica()
                    && member.mode == ServerMode::ReadOnly
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeAddress;

    fn declared(host: &str) -> ManagedInstance {
        ManagedInstance::new(
            Uuid::new_v4(),
            InstanceType::GroupMember,
            NodeAddress::new(host, 3306).unwrap(),
        )
    }

    fn reported(id: Uuid, state: MemberState, role: MemberRole) -> MemberStatus {
        MemberStatus {
            member_id: id,
            address: None,
            state,
            role,
        }
    }

    #[test]
    fn quorum_uses_the_reported_denominator() {
        // Metadata declares A, B and C; the group reports only A and B.
        let mut members = vec![declared("a"), declared("b"), declared("c")];
        let report = vec![
            reported(members[0].id, MemberState::Online, MemberRole::Primary),
            reported(members[1].id, MemberState::Online, MemberRole::Secondary),
        ];

        let eval = evaluate_group_quorum(&mut members, &report);
        assert_eq!(eval.quorum_count, 2);
        assert_eq!(eval.total_reported, 2);
        assert!(eval.have_quorum);
        assert!(!eval.metadata_discrepancy);
        assert_eq!(eval.availability, ClusterAvailability::AvailableWritable);
        assert_eq!(members[0].mode, ServerMode::ReadWrite);
        assert_eq!(members[1].mode, ServerMode::ReadOnly);
        assert_eq!(members[2].mode, ServerMode::Unavailable);
    }

    #[test]
    fn members_missing_from_metadata_prevent_quorum() {
        // A is the only declared member online; D and E are unknown to the metadata.
        let mut members = vec![declared("a"), declared("b"), declared("c")];
        let report = vec![
            reported(members[0].id, MemberState::Online, MemberRole::Primary),
            reported(Uuid::new_v4(), MemberState::Online, MemberRole::Secondary),
            reported(Uuid::new_v4(), MemberState::Online, MemberRole::Secondary),
        ];

        let eval = evaluate_group_quorum(&mut members, &report);
        assert_eq!(eval.quorum_count, 1);
        assert_eq!(eval.total_reported, 3);
        assert!(!eval.have_quorum);
        assert!(eval.metadata_discrepancy);
        assert_eq!(eval.availability, ClusterAvailability::Unavailable);
        assert!(members.iter().all(|m| m.mode == ServerMode::Unavailable));
    }

    #[test]
    fn quorum_matches_strict_majority_of_reported_members() {
        for total in 1..=7usize {
            for participating in 0..=total {
                let mut members: Vec<ManagedInstance> =
                    (0..total).map(|i| declared(&format!("m{i}"))).collect();
                let report: Vec<MemberStatus> = members
                    .iter()
                    .enumerate()
                    .map(|(i, m)| {
                        let state = if i < participating {
                            MemberState::Online
                        } else {
                            MemberState::Unreachable
                        };
                        reported(m.id, state, MemberRole::Secondary)
                    })
                    .collect();

                let eval = evaluate_group_quorum(&mut members, &report);
                assert_eq!(eval.have_quorum, 2 * participating > total);
            }
        }
    }

    #[test]
    fn all_recovering_is_a_distinct_state() {
        let mut members = vec![declared("a"), declared("b")];
        let report = vec![
            reported(members[0].id, MemberState::Recovering, MemberRole::Secondary),
            reported(members[1].id, MemberState::Recovering, MemberRole::Secondary),
        ];

        let eval = evaluate_group_quorum(&mut members, &report);
        assert!(eval.have_quorum);
        assert_eq!(eval.availability, ClusterAvailability::UnavailableRecovering);
        assert!(!eval.availability.is_available());
    }

    #[test]
    fn read_only_when_no_primary_is_online() {
        let mut members = vec![declared("a"), declared("b"), declared("c")];
        let report = vec![
            reported(members[0].id, MemberState::Recovering, MemberRole::Primary),
            reported(members[1].id, MemberState::Online, MemberRole::Secondary),
            reported(members[2].id, MemberState::Online, MemberRole::Secondary),
        ];

        let eval = evaluate_group_quorum(&mut members, &report);
        assert_eq!(eval.availability, ClusterAvailability::AvailableReadOnly);
        assert_eq!(members[0].mode, ServerMode::Unavailable);
    }

    #[test]
    fn read_replicas_follow_the_quorum() {
        let mut members = vec![declared("a"), declared("b")];
        members[1].instance_type = InstanceType::ReadReplica;

        let report = vec![reported(members[0].id, MemberState::Online, MemberRole::Primary)];
        evaluate_group_quorum(&mut members, &report);
        assert_eq!(members[1].mode, ServerMode::ReadOnly);

        let report = vec![reported(members[0].id, MemberState::Offline, MemberRole::Primary)];
        let eval = evaluate_group_quorum(&mut members, &report);
        assert!(!eval.have_quorum);
        assert_eq!(members[1].mode, ServerMode::Unavailable);
    }

    #[test]
    fn replica_set_is_available_with_any_online_member() {
        let mut members = vec![declared("a"), declared("b")];
        for member in &mut members {
            member.instance_type = InstanceType::AsyncMember;
        }
        let report = vec![reported(members[1].id, MemberState::Online, MemberRole::Secondary)];

        let eval = evaluate_replica_set(&mut members, &report);
        assert_eq!(eval.availability, ClusterAvailability::AvailableReadOnly);
        assert_eq!(members[0].mode, ServerMode::Unavailable);
        assert_eq!(members[1].mode, ServerMode::ReadOnly);
    }

    #[test]
    fn read_only_targets_set_the_ignore_flag() {
        let mut members = vec![declared("primary"), declared("secondary"), declared("replica")];
        members[0].mode = ServerMode::ReadWrite;
        members[1].mode = ServerMode::ReadOnly;
        members[2].mode = ServerMode::ReadOnly;
        members[2].instance_type = InstanceType::ReadReplica;

        let ignored = |members: &[ManagedInstance]| -> Vec<bool> {
            members.iter().map(|m| m.ignore).collect()
        };

        apply_read_only_targets(&mut members, ReadOnlyTargets::Secondaries);
        assert_eq!(ignored(&members), vec![false, false, true]);

        apply_read_only_targets(&mut members, ReadOnlyTargets::ReadReplicas);
        assert_eq!(ignored(&members), vec![false, true, false]);

        apply_read_only_targets(&mut members, ReadOnlyTargets::All);
        assert_eq!(ignored(&members), vec![false, false, false]);
    }
}
