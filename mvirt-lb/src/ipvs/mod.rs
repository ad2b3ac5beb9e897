//! Kernel IPVS control plane.
//!
//! [`IpvsTable`] is the set of primitives the reconciler drives. Each call is
//! atomic on its own; nothing is transactional across calls.

pub mod ipvsadm;

pub use ipvsadm::IpvsAdm;

use std::io;
use thiserror::Error;

use crate::types::{Destination, Service, ServiceEntry};

/// IPVS control plane errors.
#[derive(Debug, Error)]
pub enum IpvsError {
    #[error("Failed to execute {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {stderr}")]
    Failed { program: String, stderr: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Failed to parse IPVS listing: {0}")]
    Parse(String),

    #[error("Failed to load ip_vs kernel module: {0}")]
    ModuleLoad(String),
}

pub type Result<T> = std::result::Result<T, IpvsError>;

/// Primitives of the kernel load-balancing table.
///
/// Services are addressed by their endpoint (host, port, protocol) and
/// destinations by their endpoint within a service, the same way the kernel
/// addresses them.
pub trait IpvsTable: Send {
    /// Ensure the kernel facility is available. Must be idempotent.
    fn init(&mut self) -> Result<()>;

    fn add_service(&mut self, service: &Service) -> Result<()>;

    /// Delete a service. The kernel removes its destinations with it.
    fn delete_service(&mut self, service: &Service) -> Result<()>;

    fn add_destination(&mut self, service: &Service, destination: &Destination) -> Result<()>;

    fn delete_destination(&mut self, service: &Service, destination: &Destination) -> Result<()>;

    fn list_services(&mut self) -> Result<Vec<Service>>;

    /// Read one service and its destinations.
    fn get_service(&mut self, service: &Service) -> Result<ServiceEntry>;

    /// Remove every service and destination.
    fn flush(&mut self) -> Result<()>;
}
