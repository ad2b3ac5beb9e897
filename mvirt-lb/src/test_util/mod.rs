//! Test utilities for mvirt-lb.
//!
//! Provides an in-memory IPVS table so the reconciler can be exercised
//! without CAP_NET_ADMIN or the ip_vs module.

pub mod memory;

pub use memory::{Fault, MemoryTable, Op, ServiceId, service_id};

use crate::types::{Destination, ForwardMode, Protocol, Service};

/// Create a TCP round-robin test service on port 80.
pub fn test_service(host: &str) -> Service {
    Service::new(
        host.parse().expect("invalid service address"),
        80,
        Protocol::Tcp,
        "rr",
    )
}

/// Create a NAT test destination on port 8080 with weight 1.
pub fn test_destination(host: &str) -> Destination {
    Destination::new(
        host.parse().expect("invalid destination address"),
        8080,
        1,
        ForwardMode::Nat,
    )
}
