//! Quarantine of destinations that could not be connected to.
//!
//! A destination that fails to accept connections is put into quarantine,
//! shared by every route of the process. Routes skip quarantined destinations
//! when picking where to open new connections, and a background probe per
//! quarantined destination checks whether it came back.
//!
//! A route whose every destination is quarantined is told to stop accepting
//! client connections, and to resume once any of them leaves the quarantine.

mod probe;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{future::RemoteHandle, FutureExt};
use itertools::Itertools;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cluster::NodeAddress;
use crate::utils::MutexExt;

use self::probe::ProbeError;

/// Configuration of a [`QuarantineManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineConfig {
    /// Time between two probes of a quarantined destination.
    pub interval: Duration,
    /// Number of consecutive failed connection attempts after which a destination is quarantined.
    pub threshold: u32,
    /// How long a probe waits for the destination to accept its connection.
    pub probe_timeout: Duration,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            threshold: 1,
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl QuarantineConfig {
    /// Sets the time between two probes of a quarantined destination.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the number of consecutive failures that quarantine a destination.
    /// Zero is treated as one.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets how long a probe waits for a connection.
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }
}

/// A route, as seen by the quarantine.
///
/// The manager only keeps weak references to registered routes, and never
/// calls them while holding its own lock, so implementations are free to
/// call back into the [`QuarantineManager`].
pub trait QuarantineRoute: Send + Sync {
    /// Addresses the route would currently open new connections to, quarantined ones included.
    fn destination_addresses(&self) -> Vec<NodeAddress>;

    /// Makes the route accept client connections again.
    /// Returns false if it could not.
    fn start_accepting(&self) -> bool;

    /// Makes the route stop accepting client connections.
    fn stop_accepting(&self);
}

/// Shared quarantine of unreachable destinations.
///
/// Cloning is cheap; all clones share the same quarantine. Probe tasks are
/// cancelled when their destination leaves the quarantine, on [`stop`](Self::stop),
/// and when the last clone is dropped.
#[derive(Clone)]
pub struct QuarantineManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QuarantineConfig,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<NodeAddress, Entry>,
    routes: HashMap<String, Weak<dyn QuarantineRoute>>,
    // Consecutive failures of destinations not quarantined yet.
    failures: HashMap<NodeAddress, u32>,
    stopped: bool,
}

struct Entry {
    routes: BTreeSet<String>,
    // Wakes the probe up before its interval elapses.
    recheck: Arc<Notify>,
    _probe: RemoteHandle<()>,
}

impl State {
    fn upgrade_routes<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Vec<(String, Arc<dyn QuarantineRoute>)> {
        names
            .into_iter()
            .filter_map(|name| {
                let route = self.routes.get(name)?.upgrade()?;
                Some((name.clone(), route))
            })
            .collect()
    }
}

impl QuarantineManager {
    /// Creates an empty quarantine.
    pub fn new(config: QuarantineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Configuration the manager was created with.
    pub fn config(&self) -> &QuarantineConfig {
        &self.inner.config
    }

    /// Makes `route` known under `name`, replacing a route registered earlier under the same name.
    pub fn register_route(&self, name: &str, route: &Arc<dyn QuarantineRoute>) {
        self.inner
            .state
            .lock_unpoisoned()
            .routes
            .insert(name.to_owned(), Arc::downgrade(route));
    }

    /// Forgets the route: it stops referencing any quarantined destination,
    /// and destinations no other route references leave the quarantine.
    pub fn unregister_route(&self, name: &str) {
        self.unregister_route_matching(name, |_| true);
    }

    /// Like [`unregister_route`](Self::unregister_route), but only if `route`
    /// is still the one registered under `name`, and not a route which replaced it.
    pub(crate) fn unregister_route_instance(&self, name: &str, route: &dyn QuarantineRoute) {
        let route = route as *const dyn QuarantineRoute as *const ();
        self.unregister_route_matching(name, |registered| {
            std::ptr::eq(registered.as_ptr() as *const (), route)
        });
    }

    fn unregister_route_matching(
        &self,
        name: &str,
        is_registered: impl FnOnce(&Weak<dyn QuarantineRoute>) -> bool,
    ) {
        let released = {
            let mut state = self.inner.state.lock_unpoisoned();
            let replaced = state
                .routes
                .get(name)
                .is_some_and(|registered| !is_registered(registered));
            if replaced {
                debug!(route = %name, "Route was replaced, keeping its registration");
                return;
            }
            state.routes.remove(name);
            release_route(&mut state, name, |_| true)
        };
        log_released(&released, name);
    }

    /// Quarantines `address` on behalf of the given routes.
    ///
    /// If the address is already quarantined, the routes are only added to
    /// the ones referencing it. Otherwise a probe task is started, every
    /// registered route having the address among its destinations starts
    /// referencing it as well, and every referencing route whose destinations
    /// are now all quarantined is told to stop accepting connections.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime, which runs the probe task.
    pub fn add_to_quarantine<I, S>(&self, address: NodeAddress, routes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let routes: BTreeSet<String> = routes.into_iter().map(Into::into).collect();

        let registered = {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.stopped {
                debug!(address = %address, "Quarantine is stopped, not quarantining");
                return;
            }
            if let Some(entry) = state.entries.get_mut(&address) {
                entry.routes.extend(routes);
                return;
            }

            let recheck = Arc::new(Notify::new());
            let (probe_task, probe_handle) = probe_loop(
                Arc::downgrade(&self.inner),
                address.clone(),
                recheck.clone(),
            )
            .remote_handle();
            tokio::spawn(probe_task);

            state.failures.remove(&address);
            state.entries.insert(
                address.clone(),
                Entry {
                    routes: routes.clone(),
                    recheck,
                    _probe: probe_handle,
                },
            );
            state.upgrade_routes(state.routes.keys())
        };

        // Routes are asked for their destinations without holding the lock.
        let referencing: Vec<(String, Arc<dyn QuarantineRoute>, Vec<NodeAddress>)> = registered
            .into_iter()
            .filter_map(|(name, route)| {
                let destinations = route.destination_addresses();
                (routes.contains(&name) || destinations.contains(&address))
                    .then_some((name, route, destinations))
            })
            .collect();

        {
            let mut state = self.inner.state.lock_unpoisoned();
            if let Some(entry) = state.entries.get_mut(&address) {
                entry
                    .routes
                    .extend(referencing.iter().map(|(name, _, _)| name.clone()));
            }
        }

        info!(
            address = %address,
            "Destination added to quarantine, referenced by routes: [{}]",
            referencing.iter().map(|(name, _, _)| name).format(", ")
        );

        for (name, route, destinations) in referencing {
            if destinations
                .iter()
                .all(|destination| self.is_quarantined(destination))
            {
                info!(
                    route = %name,
                    "Every destination of the route is quarantined, stopping accepting connections"
                );
                route.stop_accepting();
            }
        }
    }

    /// Returns true if `address` is quarantined.
    pub fn is_quarantined(&self, address: &NodeAddress) -> bool {
        self.inner
            .state
            .lock_unpoisoned()
            .entries
            .contains_key(address)
    }

    /// Reports the outcome of a connection attempt made by `route` to `address`.
    ///
    /// A success resets the failure count of the address. A failure that
    /// reaches the configured threshold quarantines it.
    pub fn report_connection_result(&self, address: &NodeAddress, route: &str, success: bool) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            if success {
                state.failures.remove(address);
                return;
            }
            if !state.entries.contains_key(address) {
                let threshold = self.inner.config.threshold.max(1);
                let failures = state.failures.entry(address.clone()).or_insert(0);
                *failures += 1;
                if *failures < threshold {
                    debug!(
                        address = %address,
                        failures = *failures,
                        threshold,
                        "Connection failure below the quarantine threshold"
                    );
                    return;
                }
            }
        }
        self.add_to_quarantine(address.clone(), [route]);
    }

    /// Updates the quarantine after a metadata refresh of `route`.
    ///
    /// If the route's destinations `changed`, the route stops referencing
    /// quarantined addresses missing from `allowed`, and addresses referenced
    /// by no route leave the quarantine. Quarantined addresses present in
    /// `allowed` are probed again right away.
    pub fn refresh_quarantine(&self, route: &str, changed: bool, allowed: &[NodeAddress]) {
        let released = {
            let mut state = self.inner.state.lock_unpoisoned();
            let released = if changed {
                release_route(&mut state, route, |address| !allowed.contains(address))
            } else {
                Vec::new()
            };

            for address in allowed {
                if let Some(entry) = state.entries.get(address) {
                    entry.recheck.notify_one();
                }
            }
            released
        };
        log_released(&released, route);
    }

    /// Empties the quarantine and cancels every probe. Later additions are ignored.
    ///
    /// Calling it more than once is harmless.
    pub fn stop(&self) {
        let entries = {
            let mut state = self.inner.state.lock_unpoisoned();
            state.stopped = true;
            state.failures.clear();
            std::mem::take(&mut state.entries)
        };
        if !entries.is_empty() {
            debug!("Quarantine stopped, releasing {} destinations", entries.len());
        }
        drop(entries);
    }

    /// Quarantined addresses, sorted.
    pub fn quarantined(&self) -> Vec<NodeAddress> {
        self.inner
            .state
            .lock_unpoisoned()
            .entries
            .keys()
            .cloned()
            .sorted()
            .collect()
    }

    /// Number of quarantined addresses.
    pub fn len(&self) -> usize {
        self.inner.state.lock_unpoisoned().entries.len()
    }

    /// Returns true if nothing is quarantined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn referencing_routes(&self, address: &NodeAddress) -> Option<Vec<String>> {
        let state = self.inner.state.lock_unpoisoned();
        let entry = state.entries.get(address)?;
        Some(entry.routes.iter().cloned().collect())
    }
}

impl std::fmt::Debug for QuarantineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineManager")
            .field("config", &self.inner.config)
            .field("quarantined", &self.quarantined())
            .finish()
    }
}

/// Drops the references `route` holds on the addresses matching `should_release`,
/// and removes entries left without references.
///
/// The removed entries are returned, so that they (and the probe handles they
/// hold) are dropped after the lock is released.
fn release_route(
    state: &mut State,
    route: &str,
    mut should_release: impl FnMut(&NodeAddress) -> bool,
) -> Vec<(NodeAddress, Entry)> {
    let mut emptied = Vec::new();
    for (address, entry) in state.entries.iter_mut() {
        if should_release(address) && entry.routes.remove(route) && entry.routes.is_empty() {
            emptied.push(address.clone());
        }
    }
    emptied
        .into_iter()
        .filter_map(|address| {
            let entry = state.entries.remove(&address)?;
            Some((address, entry))
        })
        .collect()
}

fn log_released(released: &[(NodeAddress, Entry)], route: &str) {
    for (address, _) in released {
        info!(
            address = %address,
            route = %route,
            "Destination removed from quarantine, no route references it anymore"
        );
    }
}

async fn probe_loop(inner: Weak<Inner>, address: NodeAddress, recheck: Arc<Notify>) {
    let (interval, probe_timeout) = match inner.upgrade() {
        Some(inner) => (inner.config.interval, inner.config.probe_timeout),
        None => return,
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = recheck.notified() => {
                debug!(address = %address, "Quarantined destination is probed ahead of time");
            }
        }

        match probe::probe(&address, probe_timeout).await {
            Ok(()) => {
                info!(address = %address, "Destination is reachable again, removing it from quarantine");
                break;
            }
            Err(ProbeError::Unreachable(err)) => {
                debug!(address = %address, error = %err, "Quarantined destination is still unreachable");
            }
            Err(err @ ProbeError::Internal(_)) => {
                warn!(
                    address = %address,
                    error = %err,
                    "Could not probe quarantined destination, removing it from quarantine"
                );
                break;
            }
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let (entry, routes) = {
        let mut state = inner.state.lock_unpoisoned();
        let Some(entry) = state.entries.remove(&address) else {
            return;
        };
        let routes = state.upgrade_routes(&entry.routes);
        (entry, routes)
    };
    // Dropping the entry cancels this very task, which is about to finish anyway.
    drop(entry);

    for (name, route) in routes {
        if !route.start_accepting() {
            warn!(route = %name, "Failed to resume accepting connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::test_utils::{setup_tracing, wait_for, RecordingRoute};

    fn long_interval() -> QuarantineManager {
        QuarantineManager::new(QuarantineConfig::default().with_interval(Duration::from_secs(3600)))
    }

    fn local(addr: SocketAddr) -> NodeAddress {
        NodeAddress::new(addr.ip().to_string(), addr.port()).unwrap()
    }

    async fn closed_port() -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        local(listener.local_addr().unwrap())
    }

    fn register(manager: &QuarantineManager, name: &str, route: &Arc<RecordingRoute>) {
        let route: Arc<dyn QuarantineRoute> = route.clone();
        manager.register_route(name, &route);
    }

    #[tokio::test]
    async fn quarantined_address_is_reported() {
        setup_tracing();
        let manager = long_interval();
        let address = closed_port().await;

        assert!(!manager.is_quarantined(&address));
        manager.add_to_quarantine(address.clone(), ["r1"]);
        assert!(manager.is_quarantined(&address));
        assert!(manager.is_quarantined(&address));
        assert_eq!(manager.quarantined(), vec![address.clone()]);

        // Adding again merges the routes.
        manager.add_to_quarantine(address.clone(), ["r2"]);
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.referencing_routes(&address).unwrap(),
            vec!["r1".to_owned(), "r2".to_owned()]
        );
    }

    #[tokio::test]
    async fn failures_below_threshold_do_not_quarantine() {
        setup_tracing();
        let manager = QuarantineManager::new(
            QuarantineConfig::default()
                .with_interval(Duration::from_secs(3600))
                .with_threshold(2),
        );
        let address = closed_port().await;

        manager.report_connection_result(&address, "r1", false);
        assert!(!manager.is_quarantined(&address));

        // A success in between starts counting from scratch.
        manager.report_connection_result(&address, "r1", true);
        manager.report_connection_result(&address, "r1", false);
        assert!(!manager.is_quarantined(&address));

        manager.report_connection_result(&address, "r1", false);
        assert!(manager.is_quarantined(&address));
    }

    #[tokio::test]
    async fn route_stops_accepting_when_all_destinations_are_quarantined() {
        setup_tracing();
        let manager = long_interval();
        let a = closed_port().await;
        let b = closed_port().await;
        let route = Arc::new(RecordingRoute::new(vec![a.clone(), b.clone()]));
        register(&manager, "r1", &route);

        manager.add_to_quarantine(a, ["r1"]);
        assert_eq!(route.stops(), 0);

        manager.add_to_quarantine(b, ["r1"]);
        assert_eq!(route.stops(), 1);
    }

    #[tokio::test]
    async fn routes_sharing_a_destination_all_reference_it() {
        setup_tracing();
        let manager = long_interval();
        let a = closed_port().await;
        let b = closed_port().await;
        let reporting = Arc::new(RecordingRoute::new(vec![a.clone()]));
        let sharing = Arc::new(RecordingRoute::new(vec![a.clone()]));
        let partly_sharing = Arc::new(RecordingRoute::new(vec![a.clone(), b.clone()]));
        let unrelated = Arc::new(RecordingRoute::new(vec![b.clone()]));
        register(&manager, "r1", &reporting);
        register(&manager, "r2", &sharing);
        register(&manager, "r3", &partly_sharing);
        register(&manager, "r4", &unrelated);

        manager.add_to_quarantine(a.clone(), ["r1"]);
        assert_eq!(
            manager.referencing_routes(&a).unwrap(),
            vec!["r1".to_owned(), "r2".to_owned(), "r3".to_owned()]
        );
        assert_eq!(reporting.stops(), 1);
        assert_eq!(sharing.stops(), 1);
        assert_eq!(partly_sharing.stops(), 0);
        assert_eq!(unrelated.stops(), 0);

        // The reporting route moving away does not release a destination others still use.
        manager.refresh_quarantine("r1", true, &[]);
        assert!(manager.is_quarantined(&a));

        // A destination joining a route later is picked up when the next one is quarantined.
        partly_sharing.set_destinations(vec![b.clone()]);
        manager.add_to_quarantine(b.clone(), ["r4"]);
        assert_eq!(
            manager.referencing_routes(&b).unwrap(),
            vec!["r3".to_owned(), "r4".to_owned()]
        );
        assert_eq!(partly_sharing.stops(), 1);
        assert_eq!(unrelated.stops(), 1);
    }

    #[tokio::test]
    async fn refresh_drops_references_to_removed_destinations() {
        setup_tracing();
        let manager = long_interval();
        let a = closed_port().await;
        let b = closed_port().await;
        manager.add_to_quarantine(a.clone(), ["r1", "r2"]);
        manager.add_to_quarantine(b.clone(), ["r1"]);

        // Unchanged destinations keep everything.
        manager.refresh_quarantine("r1", false, &[]);
        assert_eq!(manager.len(), 2);

        manager.refresh_quarantine("r1", true, &[]);
        assert!(!manager.is_quarantined(&b));
        assert_eq!(manager.referencing_routes(&a).unwrap(), vec!["r2".to_owned()]);

        manager.refresh_quarantine("r2", true, &[a.clone()]);
        assert!(manager.is_quarantined(&a));
    }

    #[tokio::test]
    async fn unregistered_route_releases_its_destinations() {
        setup_tracing();
        let manager = long_interval();
        let route = Arc::new(RecordingRoute::new(Vec::new()));
        register(&manager, "r1", &route);
        let a = closed_port().await;
        let b = closed_port().await;
        manager.add_to_quarantine(a.clone(), ["r1"]);
        manager.add_to_quarantine(b.clone(), ["r1", "r2"]);

        manager.unregister_route("r1");
        assert!(!manager.is_quarantined(&a));
        assert!(manager.is_quarantined(&b));
    }

    #[tokio::test]
    async fn stopped_quarantine_stays_empty() {
        setup_tracing();
        let manager = long_interval();
        let address = closed_port().await;
        manager.add_to_quarantine(address.clone(), ["r1"]);

        manager.stop();
        manager.stop();
        assert!(manager.is_empty());

        manager.add_to_quarantine(address.clone(), ["r1"]);
        manager.report_connection_result(&address, "r1", false);
        assert!(!manager.is_quarantined(&address));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn reachable_destination_leaves_quarantine() {
        setup_tracing();
        let manager = QuarantineManager::new(
            QuarantineConfig::default().with_interval(Duration::from_millis(20)),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = local(listener.local_addr().unwrap());
        let route = Arc::new(RecordingRoute::new(vec![address.clone()]));
        register(&manager, "r1", &route);

        manager.add_to_quarantine(address.clone(), ["r1"]);
        assert_eq!(route.stops(), 1);

        wait_for(|| !manager.is_quarantined(&address)).await;
        wait_for(|| route.starts() == 1).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn refresh_probes_allowed_destinations_early() {
        setup_tracing();
        let manager = long_interval();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = local(listener.local_addr().unwrap());
        manager.add_to_quarantine(address.clone(), ["r1"]);
        assert!(manager.is_quarantined(&address));

        manager.refresh_quarantine("r1", false, &[address.clone()]);
        wait_for(|| !manager.is_quarantined(&address)).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_destination_stays_quarantined() {
        setup_tracing();
        let manager = QuarantineManager::new(
            QuarantineConfig::default()
                .with_interval(Duration::from_millis(10))
                .with_probe_timeout(Duration::from_millis(100)),
        );
        let address = closed_port().await;
        manager.add_to_quarantine(address.clone(), ["r1"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_quarantined(&address));
    }
}
