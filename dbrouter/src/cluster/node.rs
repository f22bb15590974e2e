use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use uuid::Uuid;

use crate::errors::InvalidNodeAddress;

/// Address of a database server: host, port and an optional secondary port
/// (the port of the X protocol endpoint).
///
/// Immutable once constructed. Equality, ordering and hashing only take
/// `(host, port)` into account, so a server is recognized regardless of
/// whether its secondary port is known.
#[derive(Debug, Clone)]
pub struct NodeAddress {
    host: String,
    port: u16,
    secondary_port: Option<u16>,
}

impl NodeAddress {
    /// Creates a validated address.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, InvalidNodeAddress> {
        let host = host.into();
        if host.is_empty() {
            return Err(InvalidNodeAddress::EmptyHost);
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '?' || c == '#' || c == '@')
        {
            return Err(InvalidNodeAddress::InvalidHost(host));
        }
        if port == 0 {
            return Err(InvalidNodeAddress::ZeroPort);
        }

        Ok(Self {
            host,
            port,
            secondary_port: None,
        })
    }

    /// Returns a copy of this address carrying the given secondary port.
    pub fn with_secondary_port(self, secondary_port: u16) -> Result<Self, InvalidNodeAddress> {
        if secondary_port == 0 {
            return Err(InvalidNodeAddress::ZeroPort);
        }
        Ok(Self {
            secondary_port: Some(secondary_port),
            ..self
        })
    }

    /// Host name or IP address of the server.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Primary (classic protocol) port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Secondary (X protocol) port, if known.
    pub fn secondary_port(&self) -> Option<u16> {
        self.secondary_port
    }

    /// The same host with the secondary port used as the primary one.
    ///
    /// Returns `None` if the secondary port is not known.
    pub(crate) fn secondary_endpoint(&self) -> Option<NodeAddress> {
        self.secondary_port.map(|port| NodeAddress {
            host: self.host.clone(),
            port,
            secondary_port: None,
        })
    }

    fn is_ipv6_literal(&self) -> bool {
        self.host.contains(':')
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for NodeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.host, self.port).cmp(&(&other.host, other.port))
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ipv6_literal() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = InvalidNodeAddress;

    /// Parses `host:port` or `[ipv6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InvalidNodeAddress::Malformed(s.to_owned());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(malformed)?
        };
        if host.contains(':') && !s.starts_with('[') {
            return Err(malformed());
        }
        let port: u16 = port.parse().map_err(|_| malformed())?;

        NodeAddress::new(host, port)
    }
}

/// Kind of cluster member, as declared by the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[non_exhaustive]
pub enum InstanceType {
    /// Member of the replication group, participating in its quorum.
    GroupMember,
    /// Asynchronously replicating member of a replica set.
    AsyncMember,
    /// Read replica attached to the cluster; never part of the quorum.
    ReadReplica,
}

/// What kind of traffic an instance can currently serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMode {
    /// Writable (primary) instance.
    ReadWrite,
    /// Read-only (secondary) instance.
    ReadOnly,
    /// The instance must not be routed to.
    Unavailable,
}

/// Role of an instance within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberRole {
    /// Primary of the cluster.
    Primary,
    /// Secondary of the cluster.
    Secondary,
    /// The instance has no role right now.
    Unavailable,
}

/// One node of a managed cluster.
///
/// Instances are created (and overwritten) wholesale on each successful
/// refresh and never partially mutated afterwards, so a `ManagedInstance`
/// obtained from a [`ClusterTopology`](super::ClusterTopology) snapshot
/// describes a single, consistent point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedInstance {
    /// Stable server UUID.
    pub id: Uuid,
    /// Kind of member.
    pub instance_type: InstanceType,
    /// Address the instance accepts client connections on.
    pub address: NodeAddress,
    /// Traffic the instance can serve.
    pub mode: ServerMode,
    /// Role within the cluster.
    pub role: MemberRole,
    /// Hidden instances are not used for new connections.
    pub hidden: bool,
    /// Whether existing connections to a hidden instance should be dropped.
    pub disconnect_existing_when_hidden: bool,
    /// Set when the configuration excludes this instance from read-only routing.
    pub ignore: bool,
    /// Free-form attributes stored in the metadata.
    pub attributes: BTreeMap<String, String>,
}

impl ManagedInstance {
    /// Creates an instance as declared by the metadata, before its live state is known.
    ///
    /// Mode and role are `Unavailable` until availability is determined.
    pub fn new(id: Uuid, instance_type: InstanceType, address: NodeAddress) -> Self {
        Self {
            id,
            instance_type,
            address,
            mode: ServerMode::Unavailable,
            role: MemberRole::Unavailable,
            hidden: false,
            disconnect_existing_when_hidden: true,
            ignore: false,
            attributes: BTreeMap::new(),
        }
    }

    /// Read replicas never take part in the quorum, and never hold metadata.
    pub fn is_read_replica(&self) -> bool {
        self.instance_type == InstanceType::ReadReplica
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.mode == ServerMode::ReadWrite
    }
}
