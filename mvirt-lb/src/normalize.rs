//! Canonical comparison keys for services and destinations.
//!
//! The kernel only stores the fields that affect forwarding. Comparing desired
//! and live entities on their full values would report a change for every
//! entity that carries provider metadata, so both sides are reduced to a key
//! holding just the kernel-relevant fields before they are compared.

use std::hash::Hash;
use std::net::IpAddr;

use crate::types::{Destination, ForwardMode, Protocol, Service};

/// Maps an entity to the key it is reconciled by.
pub trait Normalize {
    type Key: Eq + Hash;

    fn normalized(&self) -> Self::Key;
}

/// Reconciliation identity of a [`Service`]. Excludes `name` and `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: String,
}

/// Reconciliation identity of a [`Destination`]. Excludes `name` and `service_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub host: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub mode: ForwardMode,
}

impl Normalize for Service {
    type Key = ServiceKey;

    fn normalized(&self) -> ServiceKey {
        ServiceKey {
            host: self.host,
            port: self.port,
            protocol: self.protocol,
            scheduler: self.scheduler.clone(),
        }
    }
}

impl Normalize for Destination {
    type Key = DestinationKey;

    fn normalized(&self) -> DestinationKey {
        DestinationKey {
            host: self.host,
            port: self.port,
            weight: self.weight,
            mode: self.mode,
        }
    }
}

/// Give live destinations reported as [`ForwardMode::Local`] the mode of the
/// desired destination on the same endpoint.
///
/// The kernel reports local delivery for any real server on a local address,
/// regardless of the requested mode, so the requested mode can't be read back.
pub fn adopt_local_modes(live: &mut [Destination], desired: &[Destination]) {
    for destination in live.iter_mut().filter(|d| d.mode == ForwardMode::Local) {
        if let Some(want) = desired
            .iter()
            .find(|d| d.endpoint() == destination.endpoint())
        {
            destination.mode = want.mode;
        }
    }
}
