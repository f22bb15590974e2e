//! Listeners can subscribe to events regarding the cluster topology and the routes.
//!
//! The publishers keep weak references to their listeners: dropping the last
//! strong reference to a listener unsubscribes it. A listener can also be
//! removed explicitly with [`ListenerRegistry::remove`].

use std::sync::{Arc, Mutex, Weak};

use crate::cluster::{ClusterTopology, ManagedInstance};
use crate::routing::Destination;
use crate::utils::MutexExt;

/// Notified when the member list of the cluster changes.
pub trait ClusterStateListener: Send + Sync {
    /// Called with the new topology after a refresh found a different member list,
    /// and after the metadata servers were found unreachable.
    ///
    /// `md_servers_reachable` is false if no metadata server could be reached at all;
    /// the members of `topology` are then dropped, and the previous topology should be treated as suspect.
    fn on_topology_changed(&self, topology: &ClusterTopology, md_servers_reachable: bool, view_id: u64);
}

/// Notified after every refresh of the metadata, whether it changed anything or not.
pub trait MetadataRefreshListener: Send + Sync {
    /// Called after a refresh was committed.
    fn on_metadata_refreshed(&self, changed: bool, topology: &ClusterTopology);
}

/// Decides whether a route should accept new client connections.
pub trait AcceptorUpdateHandler: Send + Sync {
    /// Called with the members of the target cluster after the topology changed.
    ///
    /// Returns false if the acceptor could not be updated; it will then be
    /// called again after the next refresh, even if nothing changes.
    fn on_acceptor_state_should_update(&self, instances: &[ManagedInstance]) -> bool;
}

/// Why the set of allowed nodes of a route changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AllowedNodesChangeReason {
    /// The metadata reported a different topology.
    MetadataChange,
    /// No metadata server could be reached.
    MetadataUnavailable,
}

/// Notified when the set of destinations a route allows changes.
pub trait AllowedNodesListener: Send + Sync {
    /// `existing` are the nodes existing connections may stay on, `new` the nodes
    /// new connections may be routed to. With `should_disconnect`, connections
    /// to nodes missing from `existing` should be closed.
    fn on_allowed_nodes_changed(
        &self,
        existing: &[Destination],
        new: &[Destination],
        should_disconnect: bool,
        reason: AllowedNodesChangeReason,
    );
}

/// The listening socket of a route.
pub trait SocketAcceptor: Send + Sync {
    /// Starts accepting client connections. Returns false if the socket could not be opened.
    fn start_accepting(&self) -> bool;

    /// Stops accepting client connections; existing connections are kept.
    fn stop_accepting(&self);
}

/// A set of listeners, held weakly.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener. Adding the same listener twice has no effect.
    pub fn add(&self, listener: &Arc<L>) {
        let mut listeners = self.listeners.lock_unpoisoned();
        if !listeners.iter().any(|known| same_listener(known, listener)) {
            listeners.push(Arc::downgrade(listener));
        }
    }

    /// Unsubscribes a listener. Returns false if it was not subscribed.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock_unpoisoned();
        let before = listeners.len();
        listeners.retain(|known| !same_listener(known, listener));
        listeners.len() != before
    }

    /// Listeners that are still alive, in subscription order.
    ///
    /// Callers iterate the returned copy, so listeners may (un)subscribe
    /// from within their callbacks.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        let mut listeners = self.listeners.lock_unpoisoned();
        listeners.retain(|listener| listener.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// True if no live listener is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_listener<L: ?Sized>(known: &Weak<L>, listener: &Arc<L>) -> bool {
    // Compare data pointers only; vtable pointers of the same object may differ.
    std::ptr::eq(
        known.as_ptr() as *const (),
        Arc::as_ptr(listener) as *const (),
    )
}

impl<L: ?Sized> std::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.listeners.lock_unpoisoned().len())
            .finish()
    }
}
