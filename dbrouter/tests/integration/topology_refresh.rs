use std::sync::Arc;

use assert_matches::assert_matches;
use dbrouter::cluster::metadata::{MemberState, MemberStatus};
use dbrouter::cluster::{
    ClusterAvailability, InstanceType, ManagedInstance, MemberRole, ReadOnlyTargets,
};
use dbrouter::errors::MetadataError;
use dbrouter::quarantine::{QuarantineConfig, QuarantineManager};
use dbrouter::routing::{DestinationSelector, Role, RouteConfig};
use dbrouter::test_utils::{group_cluster, mock_address, MockMetadataSource};
use uuid::Uuid;

use crate::utils::{setup_tracing, start_cache, start_cache_with};

fn hosts(selector: &DestinationSelector) -> Vec<String> {
    selector
        .destinations()
        .iter()
        .map(|destination| destination.hostname().to_owned())
        .collect()
}

#[tokio::test]
async fn unreachable_metadata_server_is_skipped() {
    setup_tracing();
    let source = Arc::new(MockMetadataSource::new());
    let cluster = group_cluster("prod", &["a", "b", "c"]);
    source.set_metadata("a", 1, vec![cluster.clone()]);
    source.set_metadata("b", 1, vec![cluster.clone()]);
    source.set_primary(&cluster, "a");
    source.set_unreachable("a", true);

    let cache = start_cache(&source, &["a", "b"]);
    let handle = cache.handle();
    handle.refresh_now().await.unwrap();

    let status = handle.refresh_status();
    assert_eq!(status.last_metadata_server, Some(mock_address("b")));
    assert_eq!(status.refresh_failed, 0);
    assert!(status.last_refresh_succeeded.is_some());
    // The member report of the unreachable primary is missing, the others have quorum.
    assert_eq!(
        handle.topology().target_availability(),
        ClusterAvailability::AvailableWritable
    );
}

#[tokio::test]
async fn missing_cluster_is_reported() {
    setup_tracing();
    let source = Arc::new(MockMetadataSource::new());
    let other = group_cluster("staging", &["a", "b", "c"]);
    source.set_metadata("a", 1, vec![other]);

    let cache = start_cache(&source, &["a"]);
    let result = cache.handle().refresh_now().await;
    assert_matches!(result, Err(MetadataError::ClusterNotFound(_)));
    assert!(cache.handle().topology().target().is_none());
}

#[tokio::test]
async fn destinations_follow_primary_switch() {
    setup_tracing();
    let source = Arc::new(MockMetadataSource::new());
    let cluster = group_cluster("prod", &["a", "b", "c"]);
    source.set_metadata("a", 1, vec![cluster.clone()]);
    source.set_primary(&cluster, "a");
    let cache = start_cache(&source, &["a"]);
    let quarantine = QuarantineManager::new(QuarantineConfig::default());

    let primary = DestinationSelector::new(
        "rw",
        RouteConfig::new(Role::Primary),
        cache.handle(),
        quarantine.clone(),
    )
    .unwrap();
    let secondary = DestinationSelector::new(
        "ro",
        RouteConfig::new(Role::Secondary),
        cache.handle(),
        quarantine,
    )
    .unwrap();

    cache.handle().refresh_now().await.unwrap();
    assert_eq!(hosts(&primary), ["a"]);
    assert_eq!(hosts(&secondary), ["b", "c"]);

    source.set_primary(&cluster, "c");
    source.set_metadata("a", 2, vec![cluster.clone()]);
    cache.handle().refresh_now().await.unwrap();
    assert_eq!(cache.handle().topology().view_id, 2);
    assert_eq!(hosts(&primary), ["c"]);
    // Rotation goes on from where it was.
    assert_eq!(hosts(&secondary), ["b", "a"]);
}

#[tokio::test]
async fn undeclared_members_prevent_quorum() {
    setup_tracing();
    let source = Arc::new(MockMetadataSource::new());
    let cluster = group_cluster("prod", &["a", "b", "c"]);
    source.set_metadata("a", 1, vec![cluster.clone()]);
    let a = &cluster.members[0];
    let report = vec![
        MemberStatus {
            member_id: a.id,
            address: Some(a.address.clone()),
            state: MemberState::Online,
            role: MemberRole::Primary,
        },
        MemberStatus {
            member_id: Uuid::new_v4(),
            address: Some(mock_address("d")),
            state: MemberState::Online,
            role: MemberRole::Secondary,
        },
        MemberStatus {
            member_id: Uuid::new_v4(),
            address: Some(mock_address("e")),
            state: MemberState::Online,
            role: MemberRole::Secondary,
        },
    ];
    source.set_report("a", report);

    let cache = start_cache(&source, &["a"]);
    let selector = DestinationSelector::new(
        "rw",
        RouteConfig::new(Role::PrimaryAndSecondary),
        cache.handle(),
        QuarantineManager::new(QuarantineConfig::default()),
    )
    .unwrap();
    cache.handle().refresh_now().await.unwrap();

    let topology = cache.handle().topology();
    assert_eq!(topology.target_availability(), ClusterAvailability::Unavailable);
    assert!(topology.target().unwrap().metadata_discrepancy);
    assert!(hosts(&selector).is_empty());
    // Both the initial and the requested refresh found no quorum.
    assert_eq!(cache.handle().refresh_status().refresh_failed, 2);
}

#[tokio::test]
async fn read_only_targets_select_read_replicas() {
    setup_tracing();
    let source = Arc::new(MockMetadataSource::new());
    let mut cluster = group_cluster("prod", &["a", "b", "c"]);
    // Read replicas are not part of the group, so they are missing from its reports.
    source.set_primary(&cluster, "a");
    cluster.members.push(ManagedInstance::new(
        Uuid::new_v4(),
        InstanceType::ReadReplica,
        mock_address("rr"),
    ));
    source.set_metadata("a", 1, vec![cluster]);

    let expectations = [
        (ReadOnlyTargets::Secondaries, vec!["b", "c"]),
        (ReadOnlyTargets::ReadReplicas, vec!["rr"]),
        (ReadOnlyTargets::All, vec!["b", "c", "rr"]),
    ];
    for (read_only_targets, expected) in expectations {
        let cache = start_cache_with(&source, &["a"], |config| {
            config.with_read_only_targets(read_only_targets)
        });
        let selector = DestinationSelector::new(
            "ro",
            RouteConfig::new(Role::Secondary),
            cache.handle(),
            QuarantineManager::new(QuarantineConfig::default()),
        )
        .unwrap();
        cache.handle().refresh_now().await.unwrap();

        let (available, _) = selector.filter_by_role(cache.handle().topology().target_members(), true);
        let available: Vec<&str> = available.iter().map(|destination| destination.hostname()).collect();
        assert_eq!(available, expected, "read-only targets: {read_only_targets:?}");
    }
}
