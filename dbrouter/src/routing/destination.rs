use std::fmt::Display;

use uuid::Uuid;

use crate::cluster::{ManagedInstance, NodeAddress, ServerMode};

/// A server a connection can be routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    id: String,
    address: NodeAddress,
    server_id: Uuid,
    mode: ServerMode,
}

impl Destination {
    /// Builds the destination of an instance, connecting to the given endpoint of it.
    pub(crate) fn new(instance: &ManagedInstance, address: NodeAddress) -> Self {
        Self {
            id: address.to_string(),
            address,
            server_id: instance.id,
            mode: instance.mode,
        }
    }

    /// Opaque identifier of the destination (`host:port`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address to connect to.
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Host name of the destination.
    pub fn hostname(&self) -> &str {
        self.address.host()
    }

    /// Port of the destination.
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Server UUID of the instance behind the destination.
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Mode of the instance at the time the destination was computed.
    pub fn mode(&self) -> ServerMode {
        self.mode
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Ordered list of destinations for one connection attempt.
///
/// Every call to the selector builds a fresh list, owned by the caller.
/// An empty list means that no destination is available for the route's role
/// right now; it is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations {
    destinations: Vec<Destination>,
    primary_already_used: bool,
    is_primary_destination: bool,
}

impl Destinations {
    pub(crate) fn new(
        destinations: Vec<Destination>,
        primary_already_used: bool,
        is_primary_destination: bool,
    ) -> Self {
        Self {
            destinations,
            primary_already_used,
            is_primary_destination,
        }
    }

    /// True if the primaries were already tried as a fallback for a secondary route.
    pub fn primary_already_used(&self) -> bool {
        self.primary_already_used
    }

    /// True if the destinations are primaries of a primary route.
    ///
    /// A retry uses it to know which failover path applies.
    pub fn is_primary_destination(&self) -> bool {
        self.is_primary_destination
    }

    /// Iterates over the destinations in the order they should be tried.
    pub fn iter(&self) -> std::slice::Iter<'_, Destination> {
        self.destinations.iter()
    }

    /// Number of destinations.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// True if there is no destination to try.
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Destination that should be tried first, if any.
    pub fn first(&self) -> Option<&Destination> {
        self.destinations.first()
    }
}

impl IntoIterator for Destinations {
    type Item = Destination;
    type IntoIter = std::vec::IntoIter<Destination>;

    fn into_iter(self) -> Self::IntoIter {
        self.destinations.into_iter()
    }
}

impl<'a> IntoIterator for &'a Destinations {
    type Item = &'a Destination;
    type IntoIter = std::slice::Iter<'a, Destination>;

    fn into_iter(self) -> Self::IntoIter {
        self.destinations.iter()
    }
}
