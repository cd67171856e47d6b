//! Log tailing and aggregation for Kubernetes.
//!
//! Log origins (container log files on a node, or the pods/log API) are
//! wrapped as [`source::StreamSource`]s and fanned into one bounded stream by
//! an [`aggregator::Aggregator`]. A [`session::Session`] ties that stream to
//! one authorized caller whose identity is carried along every hop.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod csrf;
pub mod debounce;
pub mod error;
pub mod identity;
pub mod kubernetes;
pub mod permission;
pub mod session;
pub mod source;
pub mod types;
pub mod upgrade;
pub mod utils;

#[cfg(test)]
mod testing;
