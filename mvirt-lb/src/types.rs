//! Domain types for virtual services and their backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet forwarding method used to reach a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Masquerading (NAT)
    #[default]
    #[serde(alias = "masq")]
    Nat,
    /// Direct routing (gatewaying)
    #[serde(alias = "dr")]
    Route,
    /// IP-in-IP tunneling
    #[serde(alias = "tun", alias = "ipip")]
    Tunnel,
    /// Delivered to a local socket. Reported by the kernel for destinations
    /// on a local address, whatever mode was requested.
    Local,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Nat => "nat",
            ForwardMode::Route => "route",
            ForwardMode::Tunnel => "tunnel",
            ForwardMode::Local => "local",
        }
    }
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A virtual service: the client-facing address balanced by the kernel.
///
/// `name` and `mode` are metadata owned by the state provider. The kernel
/// does not persist them, so services read back from the kernel carry empty
/// values for both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// IPVS scheduler identifier (rr, wrr, lc, wlc, ...)
    pub scheduler: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: String,
}

impl Service {
    pub fn new(host: IpAddr, port: u16, protocol: Protocol, scheduler: impl Into<String>) -> Self {
        Self {
            host,
            port,
            protocol,
            scheduler: scheduler.into(),
            name: String::new(),
            mode: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The key the kernel addresses this service by.
    pub fn endpoint(&self) -> (IpAddr, u16, Protocol) {
        (self.host, self.port, self.protocol)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.protocol, self.addr(), self.scheduler)
    }
}

/// A backend real server bound to exactly one virtual service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: IpAddr,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub mode: ForwardMode,
    #[serde(default)]
    pub name: String,
    /// Name of the owning service
    #[serde(default)]
    pub service_id: String,
}

fn default_weight() -> u32 {
    1
}

impl Destination {
    pub fn new(host: IpAddr, port: u16, weight: u32, mode: ForwardMode) -> Self {
        Self {
            host,
            port,
            weight,
            mode,
            name: String::new(),
            service_id: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    /// The key the kernel addresses this destination by within its service.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, w={})", self.endpoint(), self.mode, self.weight)
    }
}

/// A service together with its destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service: Service,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl ServiceEntry {
    pub fn new(service: Service, destinations: Vec<Destination>) -> Self {
        Self {
            service,
            destinations,
        }
    }
}
