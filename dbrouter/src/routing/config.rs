use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::errors::RouteConfigError;

/// Which members of the cluster a route sends connections to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Role {
    /// The writable member.
    Primary,
    /// Read-only members.
    Secondary,
    /// Both the writable and the read-only members.
    PrimaryAndSecondary,
}

impl FromStr for Role {
    type Err = RouteConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIMARY" => Ok(Role::Primary),
            "SECONDARY" => Ok(Role::Secondary),
            "PRIMARY_AND_SECONDARY" => Ok(Role::PrimaryAndSecondary),
            _ => Err(RouteConfigError::InvalidRole(s.to_owned())),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Primary => "PRIMARY",
            Role::Secondary => "SECONDARY",
            Role::PrimaryAndSecondary => "PRIMARY_AND_SECONDARY",
        })
    }
}

/// How the destinations of a route are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RoutingStrategy {
    /// Always in the order of the metadata.
    FirstAvailable,
    /// Rotated by one position on every connection.
    RoundRobin,
    /// Like [`RoutingStrategy::RoundRobin`]; a secondary route falls back to
    /// the primaries when no secondary is available.
    RoundRobinWithFallback,
}

impl FromStr for RoutingStrategy {
    type Err = RouteConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-available" => Ok(RoutingStrategy::FirstAvailable),
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "round-robin-with-fallback" => Ok(RoutingStrategy::RoundRobinWithFallback),
            _ => Err(RouteConfigError::InvalidRoutingStrategy(s.to_owned())),
        }
    }
}

impl Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RoutingStrategy::FirstAvailable => "first-available",
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::RoundRobinWithFallback => "round-robin-with-fallback",
        })
    }
}

/// Client protocol of a route; decides which port of the members is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Protocol {
    /// The classic protocol, on the member's primary port.
    #[default]
    Classic,
    /// The X protocol, on the member's secondary port.
    X,
}

impl FromStr for Protocol {
    type Err = RouteConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classic" => Ok(Protocol::Classic),
            "x" => Ok(Protocol::X),
            _ => Err(RouteConfigError::InvalidProtocol(s.to_owned())),
        }
    }
}

/// Scheme of the destination URIs routes are configured with.
pub const METADATA_CACHE_SCHEME: &str = "metadata-cache";

/// Static configuration of one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Members the route sends connections to.
    pub role: Role,
    /// How destinations are ordered.
    pub strategy: RoutingStrategy,
    /// Client protocol.
    pub protocol: Protocol,
    /// Close connections to a secondary when it gets promoted to primary.
    /// Only valid for [`Role::Secondary`].
    pub disconnect_on_promoted_to_primary: bool,
    /// Close connections when no metadata server can be reached.
    pub disconnect_on_metadata_unavailable: bool,
    /// How long a primary route waits for a new primary after the old one refused a connection.
    pub primary_failover_timeout: Duration,
}

impl RouteConfig {
    /// Creates a configuration for the role, with the role's default strategy.
    pub fn new(role: Role) -> Self {
        let strategy = match role {
            Role::Primary => RoutingStrategy::FirstAvailable,
            Role::Secondary | Role::PrimaryAndSecondary => RoutingStrategy::RoundRobin,
        };
        Self {
            role,
            strategy,
            protocol: Protocol::Classic,
            disconnect_on_promoted_to_primary: false,
            disconnect_on_metadata_unavailable: false,
            primary_failover_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the routing strategy.
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the client protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets whether connections to a promoted secondary are closed.
    pub fn with_disconnect_on_promoted_to_primary(mut self, disconnect: bool) -> Self {
        self.disconnect_on_promoted_to_primary = disconnect;
        self
    }

    /// Sets whether connections are closed when the metadata is unavailable.
    pub fn with_disconnect_on_metadata_unavailable(mut self, disconnect: bool) -> Self {
        self.disconnect_on_metadata_unavailable = disconnect;
        self
    }

    /// Sets how long a primary route waits for a failover.
    pub fn with_primary_failover_timeout(mut self, timeout: Duration) -> Self {
        self.primary_failover_timeout = timeout;
        self
    }

    /// Rejects combinations that cannot work, before any traffic is routed.
    pub fn validate(&self) -> Result<(), RouteConfigError> {
        if self.strategy == RoutingStrategy::RoundRobinWithFallback && self.role != Role::Secondary
        {
            return Err(RouteConfigError::UnsupportedStrategy {
                strategy: self.strategy,
                role: self.role,
            });
        }
        if self.disconnect_on_promoted_to_primary && self.role != Role::Secondary {
            return Err(RouteConfigError::DisconnectOnPromotedRequiresSecondary(
                self.role,
            ));
        }
        Ok(())
    }

    /// Parses a destination URI such as
    /// `metadata-cache://mycache/default?role=SECONDARY&routing_strategy=round-robin-with-fallback`.
    ///
    /// The strategy given in the routing section (outside of the URI) takes
    /// precedence over the role's default; the URI itself may not set it twice.
    /// The result is validated.
    ///
    /// # Example
    /// ```
    /// # use dbrouter::routing::{Role, RouteConfig, RoutingStrategy};
    /// let config = RouteConfig::from_destination_uri(
    ///     "metadata-cache://cache/default?role=SECONDARY&disconnect_on_promoted_to_primary=yes",
    ///     None,
    /// )
    /// .unwrap();
    /// assert_eq!(config.role, Role::Secondary);
    /// assert_eq!(config.strategy, RoutingStrategy::RoundRobin);
    /// assert!(config.disconnect_on_promoted_to_primary);
    /// ```
    pub fn from_destination_uri(
        uri: &str,
        strategy: Option<RoutingStrategy>,
    ) -> Result<Self, RouteConfigError> {
        let url = Url::parse(uri).map_err(|err| RouteConfigError::InvalidUri {
            uri: uri.to_owned(),
            reason: err.to_string(),
        })?;
        if url.scheme() != METADATA_CACHE_SCHEME {
            return Err(RouteConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let mut role: Option<Role> = None;
        let mut uri_strategy: Option<RoutingStrategy> = None;
        let mut disconnect_on_promoted: Option<bool> = None;
        let mut disconnect_on_md_unavailable: Option<bool> = None;

        for (key, value) in url.query_pairs() {
            let duplicate = || RouteConfigError::DuplicateOption(key.to_string());
            match key.as_ref() {
                "role" => {
                    if role.replace(value.parse()?).is_some() {
                        return Err(duplicate());
                    }
                }
                "routing_strategy" => {
                    if uri_strategy.replace(value.parse()?).is_some() {
                        return Err(duplicate());
                    }
                }
                "disconnect_on_promoted_to_primary" => {
                    if disconnect_on_promoted
                        .replace(parse_yes_no(&key, &value)?)
                        .is_some()
                    {
                        return Err(duplicate());
                    }
                }
                "disconnect_on_metadata_unavailable" => {
                    if disconnect_on_md_unavailable
                        .replace(parse_yes_no(&key, &value)?)
                        .is_some()
                    {
                        return Err(duplicate());
                    }
                }
                _ => return Err(RouteConfigError::UnknownOption(key.to_string())),
            }
        }

        let role = role.ok_or(RouteConfigError::MissingRole)?;
        let mut config = RouteConfig::new(role);
        if let Some(strategy) = strategy.or(uri_strategy) {
            config.strategy = strategy;
        }
        config.disconnect_on_promoted_to_primary = disconnect_on_promoted.unwrap_or(false);
        config.disconnect_on_metadata_unavailable = disconnect_on_md_unavailable.unwrap_or(false);

        config.validate()?;
        Ok(config)
    }
}

fn parse_yes_no(option: &str, value: &str) -> Result<bool, RouteConfigError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(RouteConfigError::InvalidBooleanOption {
            option: option.to_owned(),
            value: value.to_owned(),
        }),
    }
}
