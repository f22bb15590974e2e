//! This module holds entities that allow observing the router's control plane.
//! This includes the status of the metadata refreshes, meant to be exposed
//! by an external metrics or REST layer.

pub mod refresh_status;

pub use refresh_status::RefreshStatus;
