//! Picking the destinations of a route.
//!
//! A route is configured with a [`RouteConfig`]: the [`Role`] of the instances
//! it sends traffic to, and the [`RoutingStrategy`] ordering them. Its
//! [`DestinationSelector`] turns the cached cluster topology into
//! [`Destinations`], the ordered list a new connection tries one after another.

mod balancing;
pub mod config;
mod destination;
mod selector;

pub use config::{Protocol, Role, RouteConfig, RoutingStrategy};
pub use destination::{Destination, Destinations};
pub use selector::DestinationSelector;
