//! Control plane of a router that proxies client connections to a replicated database cluster.
//!
//! The router itself accepts client connections and forwards their traffic.
//! This crate decides where that traffic goes:
//! - [`TopologyCache`](cluster::TopologyCache) polls the cluster metadata in the
//!   background and keeps an up to date [`ClusterTopology`](cluster::ClusterTopology):
//!   which members exist, which one is writable, which ones are readable.
//! - a [`DestinationSelector`](routing::DestinationSelector) per route turns the
//!   topology into an ordered list of destinations, according to the route's
//!   role and routing strategy.
//! - [`QuarantineManager`](quarantine::QuarantineManager) keeps destinations
//!   that could not be connected to out of the way, until a probe finds them reachable again.
//!
//! The database is accessed exclusively through the [`MetadataSource`](cluster::metadata::MetadataSource)
//! trait, which the embedding application implements.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dbrouter::cluster::{TargetCluster, TopologyCache, TopologyCacheConfig};
//! use dbrouter::quarantine::{QuarantineConfig, QuarantineManager};
//! use dbrouter::routing::{DestinationSelector, RouteConfig};
//! use dbrouter::test_utils::MockMetadataSource;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(MockMetadataSource::new());
//!     let config = TopologyCacheConfig::new(
//!         TargetCluster::Name("prod".to_owned()),
//!         vec!["10.0.0.5:3306".parse()?],
//!     );
//!     let cache = TopologyCache::start(config, source);
//!     let quarantine = QuarantineManager::new(QuarantineConfig::default());
//!
//!     let route = RouteConfig::from_destination_uri("metadata-cache://prod/default?role=PRIMARY", None)?;
//!     let selector = DestinationSelector::new("rw", route, cache.handle(), quarantine)?;
//!
//!     for destination in selector.destinations() {
//!         println!("would connect to {}", destination.address());
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod cluster;
pub mod errors;
pub mod observability;
pub mod policies;
pub mod quarantine;
pub mod routing;

mod utils;

#[doc(hidden)]
pub use utils::test_utils;
