//! This module holds policies, which are entities that allow plugging into
//! the control plane's behaviour. The common feature of all policies is that
//! users implement them on their own (because they simply need to implement
//! a certain trait).
//!
//! This includes:
//! - [listeners], through which routes and socket acceptors react to topology changes.

pub mod listeners;
