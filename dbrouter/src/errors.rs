//! This module contains various errors which can be returned by the router's control plane.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use crate::cluster::NodeAddress;
use crate::cluster::metadata::ClusterType;
use crate::routing::{Role, RoutingStrategy};

/// Error that occurred during a metadata refresh cycle.
///
/// Returned by [`TopologyHandle::refresh_now`](crate::cluster::TopologyHandle::refresh_now).
/// A failed cycle never invalidates the cached topology by itself; see
/// [`MetadataError::NoMetadataServerReached`] for the only case in which
/// the cached members are dropped.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// None of the metadata servers accepted a connection.
    #[error(
        "Could not connect to any of the metadata servers: [{}], last error: {last_error:?}",
        addresses.iter().format(", ")
    )]
    NoMetadataServerReached {
        /// Servers that were tried, in order.
        addresses: Vec<NodeAddress>,
        /// Error returned for the last server tried; `None` if there was no server to try.
        last_error: Option<SourceError>,
    },

    /// At least one metadata server was reached, but none of them knows the target cluster.
    #[error("Target cluster {0} was not found in the metadata of any reachable server")]
    ClusterNotFound(String),

    /// The target cluster is described by the metadata, but with an unexpected type.
    #[error("Invalid cluster type: expected {expected:?}, metadata reports {found:?}")]
    InvalidClusterType {
        /// Cluster type the cache was configured for.
        expected: ClusterType,
        /// Cluster type found in the metadata.
        found: ClusterType,
    },

    /// Every reachable server reported metadata older than the cached view.
    #[error("All reachable metadata servers report an outdated view (cached view id: {cached_view_id})")]
    OutdatedView {
        /// View id of the topology currently cached.
        cached_view_id: u64,
    },

    /// The metadata source failed while fetching the metadata.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The refresh worker is not running anymore.
    #[error("The topology refresh worker has stopped")]
    WorkerStopped,
}

impl MetadataError {
    /// Returns true if no metadata server could be reached at all,
    /// which is the signal that the cached topology must be treated as suspect.
    pub fn is_metadata_unreachable(&self) -> bool {
        matches!(self, MetadataError::NoMetadataServerReached { .. })
    }
}

/// Error reported by a [`MetadataSource`](crate::cluster::metadata::MetadataSource)
/// or one of its sessions.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SourceError {
    /// Could not connect to (or authenticate with) the server.
    #[error("Failed to connect to {address}: {reason}")]
    Connection {
        /// Server the connection was attempted to.
        address: NodeAddress,
        /// Human readable cause.
        reason: String,
    },

    /// The connection works, but the query executed by the source failed.
    #[error("Metadata query failed: {0}")]
    Query(String),

    /// The server stores metadata in a schema version the source cannot interpret.
    #[error("Unsupported metadata schema version: {0}")]
    UnsupportedSchemaVersion(String),

    /// The connection was lost in the middle of the cycle.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for SourceError {
    fn from(error: std::io::Error) -> Self {
        SourceError::IoError(Arc::new(error))
    }
}

/// Error returned when a route is constructed with an invalid configuration.
///
/// Such errors are raised eagerly, before any traffic is routed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteConfigError {
    /// Role name is not one of PRIMARY, SECONDARY, PRIMARY_AND_SECONDARY.
    #[error("Invalid server role: '{0}'. Allowed are PRIMARY, SECONDARY, PRIMARY_AND_SECONDARY")]
    InvalidRole(String),

    /// Routing strategy name is not recognized.
    #[error(
        "Invalid routing strategy: '{0}'. Allowed are first-available, round-robin, round-robin-with-fallback"
    )]
    InvalidRoutingStrategy(String),

    /// Protocol name is not recognized.
    #[error("Invalid protocol: '{0}'. Allowed are classic, x")]
    InvalidProtocol(String),

    /// A yes/no option got another value.
    #[error("Invalid value for option '{option}': '{value}'. Allowed are 'yes' and 'no'")]
    InvalidBooleanOption {
        /// Name of the option.
        option: String,
        /// Value that was provided.
        value: String,
    },

    /// The strategy cannot be used with the role.
    #[error("Routing strategy {strategy} is not supported for role {role}")]
    UnsupportedStrategy {
        /// Configured strategy.
        strategy: RoutingStrategy,
        /// Configured role.
        role: Role,
    },

    /// `disconnect_on_promoted_to_primary` was set for a role other than SECONDARY.
    #[error("Option 'disconnect_on_promoted_to_primary' is valid only for role SECONDARY, got {0}")]
    DisconnectOnPromotedRequiresSecondary(Role),

    /// The destination URI could not be parsed.
    #[error("Invalid destination URI '{uri}': {reason}")]
    InvalidUri {
        /// URI that was provided.
        uri: String,
        /// Human readable cause.
        reason: String,
    },

    /// The destination URI uses a scheme other than `metadata-cache`.
    #[error("Unsupported destination URI scheme: '{0}'. Only 'metadata-cache' is supported")]
    UnsupportedScheme(String),

    /// The destination URI contains an option the route does not understand.
    #[error("Unsupported 'metadata-cache' parameter in URI: '{0}'")]
    UnknownOption(String),

    /// The destination URI does not specify the `role` option.
    #[error("Missing 'role' in routing destination specification")]
    MissingRole,

    /// The same option appears more than once in the destination URI.
    #[error("Option '{0}' is specified more than once")]
    DuplicateOption(String),
}

/// Error returned when a [`NodeAddress`] cannot be constructed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidNodeAddress {
    /// Host part is empty.
    #[error("Empty host name")]
    EmptyHost,

    /// Host contains characters which are never valid in a host name.
    #[error("Invalid host name: '{0}'")]
    InvalidHost(String),

    /// Port 0 cannot be connected to.
    #[error("Invalid port: 0")]
    ZeroPort,

    /// The textual form is not `host:port`.
    #[error("Expected 'host:port', got '{0}'")]
    Malformed(String),
}

/// Result of a failed connect attempt, reported by the data path.
///
/// The data path passes it back into
/// [`DestinationSelector::refresh_destinations`](crate::routing::DestinationSelector::refresh_destinations)
/// and [`DestinationSelector::report_connect_result`](crate::routing::DestinationSelector::report_connect_result).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The connect attempt did not complete in time.
    #[error("Connect timed out")]
    Timeout,

    /// No route to the destination host.
    #[error("Host unreachable")]
    HostUnreachable,

    /// The network of the destination is unreachable.
    #[error("Network unreachable")]
    NetworkUnreachable,

    /// The destination host actively refused the connection.
    #[error("Connection refused")]
    Refused,

    /// Any other IO error.
    #[error("IO Error: {0}")]
    Other(Arc<std::io::Error>),
}

impl ConnectError {
    /// Network-class errors mean the destination could not be reached at all.
    ///
    /// Member-class errors (such as a refused connection) mean the host is up,
    /// but the server process is not accepting connections.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ConnectError::Timeout | ConnectError::HostUnreachable | ConnectError::NetworkUnreachable
        )
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ConnectError::Timeout,
            ErrorKind::HostUnreachable => ConnectError::HostUnreachable,
            ErrorKind::NetworkUnreachable => ConnectError::NetworkUnreachable,
            ErrorKind::ConnectionRefused => ConnectError::Refused,
            _ => ConnectError::Other(Arc::new(error)),
        }
    }
}
