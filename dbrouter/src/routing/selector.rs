use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tracing::{debug, info};

use crate::cluster::{
    ClusterTopology, InstanceStatus, ManagedInstance, NodeAddress, ServerMode, TopologyHandle,
};
use crate::errors::{ConnectError, RouteConfigError};
use crate::policies::listeners::{
    AcceptorUpdateHandler, AllowedNodesChangeReason, AllowedNodesListener, ClusterStateListener,
    ListenerRegistry, MetadataRefreshListener, SocketAcceptor,
};
use crate::quarantine::{QuarantineManager, QuarantineRoute};
use crate::utils::MutexExt;

use super::balancing::RoundRobinState;
use super::config::{Protocol, Role, RouteConfig, RoutingStrategy};
use super::destination::{Destination, Destinations};

/// Computes the destinations of one route from the cached topology.
///
/// A selector subscribes itself to the [`TopologyHandle`] and to the
/// [`QuarantineManager`] it is created with, and stays subscribed until it is dropped.
pub struct DestinationSelector {
    route_name: String,
    config: RouteConfig,
    topology: TopologyHandle,
    quarantine: QuarantineManager,

    // Serializes the selections of this route, and only those.
    rotation: Mutex<RoundRobinState>,

    allowed_nodes: Mutex<AllowedNodes>,
    allowed_nodes_listeners: ListenerRegistry<dyn AllowedNodesListener>,

    acceptor: Mutex<Option<Arc<dyn SocketAcceptor>>>,
}

#[derive(Debug, Default)]
struct AllowedNodes {
    existing: Vec<Destination>,
    new: Vec<Destination>,
}

/// Whether quarantined instances are filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuarantineFilter {
    Skip,
    Keep,
}

impl DestinationSelector {
    /// Creates the selector of a route and subscribes it to topology and quarantine events.
    ///
    /// Invalid configurations are rejected here, before any traffic is routed.
    pub fn new(
        route_name: impl Into<String>,
        config: RouteConfig,
        topology: TopologyHandle,
        quarantine: QuarantineManager,
    ) -> Result<Arc<Self>, RouteConfigError> {
        config.validate()?;

        let selector = Arc::new(Self {
            route_name: route_name.into(),
            config,
            topology,
            quarantine,
            rotation: Mutex::new(RoundRobinState::default()),
            allowed_nodes: Mutex::new(AllowedNodes::default()),
            allowed_nodes_listeners: ListenerRegistry::new(),
            acceptor: Mutex::new(None),
        });

        let cluster_state_listener: Arc<dyn ClusterStateListener> = selector.clone();
        selector
            .topology
            .add_cluster_state_listener(&cluster_state_listener);
        let refresh_listener: Arc<dyn MetadataRefreshListener> = selector.clone();
        selector
            .topology
            .add_metadata_refresh_listener(&refresh_listener);
        let acceptor_handler: Arc<dyn AcceptorUpdateHandler> = selector.clone();
        selector.topology.add_acceptor_handler(&acceptor_handler);
        let route: Arc<dyn QuarantineRoute> = selector.clone();
        selector
            .quarantine
            .register_route(&selector.route_name, &route);

        debug!(
            route = %selector.route_name,
            role = %selector.config.role,
            strategy = %selector.config.strategy,
            "Created destination selector"
        );
        Ok(selector)
    }

    /// Name of the route.
    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    /// Configuration of the route.
    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Selects the instances the route may use.
    ///
    /// With `for_new_connections`, quarantined and hidden instances are skipped.
    /// Otherwise the selection decides which existing connections may stay open:
    /// hidden instances are kept unless they ask for their connections to be dropped,
    /// and a secondary route keeps connections to a promoted secondary unless
    /// it is configured to disconnect them.
    ///
    /// The returned flag is true if a secondary route fell back to the primaries.
    pub fn filter_by_role(
        &self,
        instances: &[ManagedInstance],
        for_new_connections: bool,
    ) -> (Vec<Destination>, bool) {
        let quarantine = if for_new_connections {
            QuarantineFilter::Skip
        } else {
            QuarantineFilter::Keep
        };
        self.filter(instances, for_new_connections, quarantine)
    }

    fn filter(
        &self,
        instances: &[ManagedInstance],
        for_new_connections: bool,
        quarantine: QuarantineFilter,
    ) -> (Vec<Destination>, bool) {
        let eligible = self.eligible(instances, for_new_connections, quarantine);

        let with_mode = |modes: &[ServerMode]| -> Vec<Destination> {
            eligible
                .iter()
                .filter(|destination| modes.contains(&destination.mode()))
                .cloned()
                .collect()
        };

        match self.config.role {
            Role::Primary => (with_mode(&[ServerMode::ReadWrite]), false),
            Role::PrimaryAndSecondary => {
                (with_mode(&[ServerMode::ReadWrite, ServerMode::ReadOnly]), false)
            }
            Role::Secondary => {
                let keeps_promoted =
                    !for_new_connections && !self.config.disconnect_on_promoted_to_primary;
                let selected = if keeps_promoted {
                    with_mode(&[ServerMode::ReadOnly, ServerMode::ReadWrite])
                } else {
                    with_mode(&[ServerMode::ReadOnly])
                };

                if selected.is_empty()
                    && self.config.strategy == RoutingStrategy::RoundRobinWithFallback
                {
                    (with_mode(&[ServerMode::ReadWrite]), true)
                } else {
                    (selected, false)
                }
            }
        }
    }

    fn eligible(
        &self,
        instances: &[ManagedInstance],
        for_new_connections: bool,
        quarantine: QuarantineFilter,
    ) -> Vec<Destination> {
        instances
            .iter()
            .filter(|instance| !instance.ignore)
            .filter(|instance| {
                if for_new_connections {
                    !instance.hidden
                } else {
                    !(instance.hidden && instance.disconnect_existing_when_hidden)
                }
            })
            .filter_map(|instance| {
                let endpoint = self.endpoint(instance)?;
                if quarantine == QuarantineFilter::Skip && self.quarantine.is_quarantined(&endpoint)
                {
                    return None;
                }
                Some(Destination::new(instance, endpoint))
            })
            .collect()
    }

    fn endpoint(&self, instance: &ManagedInstance) -> Option<NodeAddress> {
        match self.config.protocol {
            Protocol::Classic => Some(instance.address.clone()),
            Protocol::X => instance.address.secondary_endpoint(),
        }
    }

    /// Orders the available destinations according to the route's strategy.
    ///
    /// Round-robin strategies advance the route's rotation state by one step.
    pub fn balance(&self, available: Vec<Destination>, primary_fallback: bool) -> Destinations {
        let ordered = match self.config.strategy {
            RoutingStrategy::FirstAvailable => available,
            RoutingStrategy::RoundRobin | RoutingStrategy::RoundRobinWithFallback => {
                self.rotation.lock_unpoisoned().balance(available)
            }
        };
        Destinations::new(
            ordered,
            primary_fallback,
            self.config.role == Role::Primary,
        )
    }

    /// Destinations for a new connection, in the order they should be tried.
    ///
    /// An empty list means there is nothing to route to right now.
    pub fn destinations(&self) -> Destinations {
        let topology = self.topology.topology();
        let (available, primary_fallback) = self.filter_by_role(topology.target_members(), true);
        self.balance(available, primary_fallback)
    }

    /// Called after every destination of `previous` failed; `error` is the error
    /// returned by the last attempt, made to `failed`.
    ///
    /// Returns the destinations of one more attempt, or `None` if the connection
    /// attempt should fail:
    /// - a secondary route with fallback tries the primaries, once;
    /// - a primary route whose primary refused the connection waits for a new
    ///   primary to be elected (at most for the configured failover timeout),
    ///   while a primary that could not be reached at all is final.
    pub async fn refresh_destinations(
        &self,
        previous: &Destinations,
        failed: &Destination,
        error: &ConnectError,
    ) -> Option<Destinations> {
        match self.config.role {
            Role::Secondary
                if self.config.strategy == RoutingStrategy::RoundRobinWithFallback
                    && !previous.primary_already_used() =>
            {
                debug!(route = %self.route_name, "Falling back to the primaries");
                self.primaries(true)
            }
            Role::Primary if previous.is_primary_destination() => {
                if error.is_network_error() {
                    debug!(
                        route = %self.route_name,
                        error = %error,
                        "Primary is unreachable, not waiting for a failover"
                    );
                    return None;
                }
                info!(
                    route = %self.route_name,
                    "Primary {} refused the connection, waiting up to {:?} for a failover",
                    failed,
                    self.config.primary_failover_timeout
                );
                if !self
                    .topology
                    .wait_primary_failover(failed.server_id(), self.config.primary_failover_timeout)
                    .await
                {
                    return None;
                }
                self.primaries(false)
            }
            _ => None,
        }
    }

    fn primaries(&self, primary_fallback: bool) -> Option<Destinations> {
        let topology = self.topology.topology();
        let primaries: Vec<Destination> = self
            .eligible(topology.target_members(), true, QuarantineFilter::Skip)
            .into_iter()
            .filter(|destination| destination.mode() == ServerMode::ReadWrite)
            .collect();

        if primaries.is_empty() {
            return None;
        }
        Some(self.balance(primaries, primary_fallback))
    }

    /// Reports the outcome of a connection attempt to `destination`.
    ///
    /// Failures count towards quarantining the destination, and make the
    /// topology cache refresh faster.
    pub fn report_connect_result(&self, destination: &Destination, result: Result<(), &ConnectError>) {
        match result {
            Ok(()) => {
                self.quarantine
                    .report_connection_result(destination.address(), &self.route_name, true);
                self.topology
                    .mark_instance_reachability(destination.address(), InstanceStatus::Reachable);
            }
            Err(error) => {
                debug!(
                    route = %self.route_name,
                    destination = %destination,
                    error = %error,
                    "Connection attempt failed"
                );
                self.quarantine
                    .report_connection_result(destination.address(), &self.route_name, false);
                self.topology
                    .mark_instance_reachability(destination.address(), InstanceStatus::Unreachable);
            }
        }
    }

    /// Subscribes to changes of the route's allowed nodes.
    pub fn add_allowed_nodes_listener(&self, listener: &Arc<dyn AllowedNodesListener>) {
        self.allowed_nodes_listeners.add(listener);
    }

    /// Unsubscribes from changes of the route's allowed nodes.
    pub fn remove_allowed_nodes_listener(&self, listener: &Arc<dyn AllowedNodesListener>) {
        self.allowed_nodes_listeners.remove(listener);
    }

    /// Attaches the listening socket of the route, and brings it to the state the
    /// current topology calls for. Returns false if the socket should accept, but could not start;
    /// starting it is then retried after the next refresh.
    pub fn set_acceptor(&self, acceptor: Arc<dyn SocketAcceptor>) -> bool {
        *self.acceptor.lock_unpoisoned() = Some(acceptor);
        let updated = self.on_acceptor_state_should_update(self.topology.topology().target_members());
        if !updated {
            self.topology.request_acceptor_update();
        }
        updated
    }

    fn current_acceptor(&self) -> Option<Arc<dyn SocketAcceptor>> {
        self.acceptor.lock_unpoisoned().clone()
    }

    fn update_allowed_nodes(&self, topology: &ClusterTopology, md_servers_reachable: bool) {
        let members = topology.target_members();
        // Quarantine is a short-lived, per-destination state; it does not disconnect anybody.
        let (existing, _) = self.filter(members, false, QuarantineFilter::Keep);
        let (new, _) = self.filter(members, true, QuarantineFilter::Keep);

        {
            let mut allowed = self.allowed_nodes.lock_unpoisoned();
            if md_servers_reachable && allowed.existing == existing && allowed.new == new {
                return;
            }
            allowed.existing = existing.clone();
            allowed.new = new.clone();
        }

        let reason = if md_servers_reachable {
            AllowedNodesChangeReason::MetadataChange
        } else {
            AllowedNodesChangeReason::MetadataUnavailable
        };
        let should_disconnect =
            md_servers_reachable || self.config.disconnect_on_metadata_unavailable;

        info!(
            route = %self.route_name,
            ?reason,
            should_disconnect,
            "Allowed destinations changed: existing connections [{}], new connections [{}]",
            existing.iter().format(", "),
            new.iter().format(", ")
        );
        for listener in self.allowed_nodes_listeners.snapshot() {
            listener.on_allowed_nodes_changed(&existing, &new, should_disconnect, reason);
        }
    }
}

impl ClusterStateListener for DestinationSelector {
    fn on_topology_changed(&self, topology: &ClusterTopology, md_servers_reachable: bool, _view_id: u64) {
        self.update_allowed_nodes(topology, md_servers_reachable);
    }
}

impl MetadataRefreshListener for DestinationSelector {
    fn on_metadata_refreshed(&self, changed: bool, topology: &ClusterTopology) {
        let (allowed, _) = self.filter(topology.target_members(), true, QuarantineFilter::Keep);
        let addresses: Vec<NodeAddress> = allowed
            .iter()
            .map(|destination| destination.address().clone())
            .collect();
        self.quarantine
            .refresh_quarantine(&self.route_name, changed, &addresses);
    }
}

impl AcceptorUpdateHandler for DestinationSelector {
    fn on_acceptor_state_should_update(&self, instances: &[ManagedInstance]) -> bool {
        let Some(acceptor) = self.current_acceptor() else {
            return true;
        };

        let (available, _) = self.filter(instances, true, QuarantineFilter::Skip);
        if available.is_empty() {
            debug!(route = %self.route_name, "No destination available, stopping accepting connections");
            acceptor.stop_accepting();
            true
        } else {
            acceptor.start_accepting()
        }
    }
}

impl QuarantineRoute for DestinationSelector {
    fn destination_addresses(&self) -> Vec<NodeAddress> {
        let topology = self.topology.topology();
        self.filter(topology.target_members(), true, QuarantineFilter::Keep)
            .0
            .iter()
            .map(|destination| destination.address().clone())
            .collect()
    }

    fn start_accepting(&self) -> bool {
        match self.current_acceptor() {
            Some(acceptor) => acceptor.start_accepting(),
            None => true,
        }
    }

    fn stop_accepting(&self) {
        if let Some(acceptor) = self.current_acceptor() {
            acceptor.stop_accepting();
        }
    }
}

impl Drop for DestinationSelector {
    fn drop(&mut self) {
        self.quarantine
            .unregister_route_instance(&self.route_name, &*self);
    }
}

impl std::fmt::Debug for DestinationSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationSelector")
            .field("route_name", &self.route_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
