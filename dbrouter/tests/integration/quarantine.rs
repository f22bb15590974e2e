use std::sync::Arc;
use std::time::Duration;

use dbrouter::quarantine::{QuarantineConfig, QuarantineManager, QuarantineRoute};
use dbrouter::test_utils::{wait_for, RecordingRoute};

use crate::utils::{closed_destination, listening_destination, setup_tracing};

fn manager(interval: Duration) -> QuarantineManager {
    QuarantineManager::new(
        QuarantineConfig::default()
            .with_interval(interval)
            .with_probe_timeout(Duration::from_millis(500)),
    )
}

fn register(manager: &QuarantineManager, name: &str, route: &Arc<RecordingRoute>) {
    let route: Arc<dyn QuarantineRoute> = route.clone();
    manager.register_route(name, &route);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn destination_leaves_quarantine_once_reachable() {
    setup_tracing();
    let manager = manager(Duration::from_millis(50));
    let (_listener, address) = listening_destination().await;
    let route = Arc::new(RecordingRoute::new(vec![address.clone()]));
    register(&manager, "r1", &route);

    manager.report_connection_result(&address, "r1", false);
    assert!(manager.is_quarantined(&address));
    assert_eq!(route.stops(), 1);

    wait_for(|| !manager.is_quarantined(&address)).await;
    wait_for(|| route.starts() == 1).await;
    assert!(manager.is_empty());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn quarantine_is_shared_between_routes() {
    setup_tracing();
    let manager = manager(Duration::from_millis(50));
    let (_listener, shared) = listening_destination().await;
    let unreachable = closed_destination().await;

    let r1 = Arc::new(RecordingRoute::new(vec![shared.clone(), unreachable.clone()]));
    let r2 = Arc::new(RecordingRoute::new(vec![shared.clone()]));
    register(&manager, "r1", &r1);
    register(&manager, "r2", &r2);

    manager.add_to_quarantine(shared.clone(), ["r1", "r2"]);
    // r1 still has a destination to route to.
    assert_eq!(r1.stops(), 0);
    assert_eq!(r2.stops(), 1);

    manager.report_connection_result(&unreachable, "r1", false);
    assert_eq!(r1.stops(), 1);

    wait_for(|| !manager.is_quarantined(&shared)).await;
    wait_for(|| r1.starts() == 1 && r2.starts() == 1).await;

    // The closed port keeps failing its probes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.is_quarantined(&unreachable));
    assert_eq!(manager.quarantined(), vec![unreachable]);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn stopped_quarantine_cancels_probes() {
    setup_tracing();
    let manager = manager(Duration::from_millis(50));
    let (_listener, address) = listening_destination().await;
    let route = Arc::new(RecordingRoute::new(vec![address.clone()]));
    register(&manager, "r1", &route);

    manager.add_to_quarantine(address.clone(), ["r1"]);
    manager.stop();
    assert!(!manager.is_quarantined(&address));

    // No probe is left to resume the route.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(route.starts(), 0);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn dropped_route_is_not_called() {
    setup_tracing();
    let manager = manager(Duration::from_millis(50));
    let (_listener, address) = listening_destination().await;
    let route = Arc::new(RecordingRoute::new(vec![address.clone()]));
    register(&manager, "r1", &route);

    manager.add_to_quarantine(address.clone(), ["r1"]);
    let weak = Arc::downgrade(&route);
    drop(route);

    wait_for(|| !manager.is_quarantined(&address)).await;
    assert!(weak.upgrade().is_none());
}
