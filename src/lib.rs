//! bgplb: announce Kubernetes `LoadBalancer` service addresses over BGP
//!
//! Watch events are collapsed into a keyed work queue, workers reconcile each
//! key against the object cache, and the announcer advertises the resulting
//! host routes through the peers whose sessions are established.

pub mod bgp;
pub mod cli;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod service;

/// Port the operator API listens on unless overridden
pub const DEFAULT_API_PORT: u16 = 8282;
