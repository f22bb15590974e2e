//! This module holds entities that represent the monitored cluster as a whole,
//! its members, and the logic keeping their state up to date.
//!
//! This includes:
//! - member representation ([ManagedInstance], [NodeAddress]),
//! - the [metadata] seam through which the cluster is queried,
//! - [ClusterTopology], which is a snapshot of the cluster's state.
//!   - [ClusterTopology] is replaced atomically upon a metadata refresh,
//!     so readers never observe a half-updated member list.
//! - [TopologyCache], which refreshes the topology in the background,
//!   and [TopologyHandle], through which everything else reads it.
//! - quorum arithmetic and the refresh cycle that drives the cache.

mod worker;
pub use worker::{InstanceStatus, TopologyCache, TopologyCacheConfig, TopologyHandle};

mod state;
pub use state::{ClusterTopology, ManagedCluster};

pub(crate) mod node;
pub use node::{InstanceType, ManagedInstance, MemberRole, NodeAddress, ServerMode};

mod availability;
pub use availability::{ClusterAvailability, ReadOnlyTargets};

mod metadata_reader;

pub mod metadata;
pub use metadata::TargetCluster;
