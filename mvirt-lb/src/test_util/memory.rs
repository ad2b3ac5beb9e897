//! In-memory IPVS table.
//!
//! Mirrors the kernel's behaviour where the reconciler depends on it:
//! services are keyed by endpoint, duplicate adds and missing deletes fail,
//! deleting a service drops its destinations, and provider metadata (names,
//! mode labels) is not stored.
//!
//! Every call is recorded in an operation log, and single calls can be made
//! to fail with [`MemoryTable::fail_next`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ipvs::{IpvsError, IpvsTable, Result};
use crate::types::{Destination, Protocol, Service, ServiceEntry};

/// Kernel identity of a service: protocol and address.
pub type ServiceId = (Protocol, SocketAddr);

/// A recorded table call. Services are identified by [`ServiceId`],
/// destinations by their service and their own endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Init,
    Flush,
    ListServices,
    GetService(ServiceId),
    AddService(ServiceId),
    DeleteService(ServiceId),
    AddDestination(ServiceId, SocketAddr),
    DeleteDestination(ServiceId, SocketAddr),
}

impl Op {
    /// True for calls that change the table.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::Flush
                | Op::AddService(_)
                | Op::DeleteService(_)
                | Op::AddDestination(_, _)
                | Op::DeleteDestination(_, _)
        )
    }
}

/// A call armed to fail once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Init,
    Flush,
    ListServices,
    GetService(ServiceId),
    AddService(ServiceId),
    DeleteService(ServiceId),
    /// Matches by destination endpoint
    AddDestination(SocketAddr),
    /// Matches by destination endpoint
    DeleteDestination(SocketAddr),
}

#[derive(Default)]
struct Inner {
    services: BTreeMap<ServiceId, ServiceEntry>,
    ops: Vec<Op>,
    faults: Vec<Fault>,
}

impl Inner {
    fn record(&mut self, op: Op, fault: Fault) -> Result<()> {
        self.ops.push(op);
        if let Some(pos) = self.faults.iter().position(|f| *f == fault) {
            self.faults.remove(pos);
            return Err(IpvsError::Failed {
                program: "memory".to_string(),
                stderr: format!("injected fault: {fault:?}"),
            });
        }
        Ok(())
    }
}

/// Shared handle to an in-memory IPVS table. Clones see the same table.
#[derive(Clone, Default)]
pub struct MemoryTable {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory table lock poisoned")
    }

    /// Put a service straight into the table, bypassing the operation log.
    pub fn insert(&self, service: Service, destinations: Vec<Destination>) {
        let entry = ServiceEntry::new(
            kernel_service(&service),
            destinations.iter().map(kernel_destination).collect(),
        );
        self.lock().services.insert(service_id(&service), entry);
    }

    /// Current table content, ordered by protocol and address.
    pub fn snapshot(&self) -> Vec<ServiceEntry> {
        self.lock().services.values().cloned().collect()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Recorded calls that changed the table.
    pub fn mutations(&self) -> Vec<Op> {
        self.lock()
            .ops
            .iter()
            .filter(|op| op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Make the next matching call fail.
    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }
}

impl IpvsTable for MemoryTable {
    fn init(&mut self) -> Result<()> {
        self.lock().record(Op::Init, Fault::Init)
    }

    fn add_service(&mut self, service: &Service) -> Result<()> {
        let mut inner = self.lock();
        inner.record(
            Op::AddService(service_id(service)),
            Fault::AddService(service_id(service)),
        )?;

        let id = service_id(service);
        if inner.services.contains_key(&id) {
            return Err(IpvsError::AlreadyExists(service.to_string()));
        }
        inner
            .services
            .insert(id, ServiceEntry::new(kernel_service(service), Vec::new()));
        Ok(())
    }

    fn delete_service(&mut self, service: &Service) -> Result<()> {
        let mut inner = self.lock();
        inner.record(
            Op::DeleteService(service_id(service)),
            Fault::DeleteService(service_id(service)),
        )?;

        inner
            .services
            .remove(&service_id(service))
            .map(drop)
            .ok_or_else(|| IpvsError::NotFound(service.to_string()))
    }

    fn add_destination(&mut self, service: &Service, destination: &Destination) -> Result<()> {
        let mut inner = self.lock();
        inner.record(
            Op::AddDestination(service_id(service), destination.endpoint()),
            Fault::AddDestination(destination.endpoint()),
        )?;

        let entry = inner
            .services
            .get_mut(&service_id(service))
            .ok_or_else(|| IpvsError::NotFound(service.to_string()))?;
        if entry
            .destinations
            .iter()
            .any(|d| d.endpoint() == destination.endpoint())
        {
            return Err(IpvsError::AlreadyExists(destination.to_string()));
        }
        entry.destinations.push(kernel_destination(destination));
        Ok(())
    }

    fn delete_destination(&mut self, service: &Service, destination: &Destination) -> Result<()> {
        let mut inner = self.lock();
        inner.record(
            Op::DeleteDestination(service_id(service), destination.endpoint()),
            Fault::DeleteDestination(destination.endpoint()),
        )?;

        let entry = inner
            .services
            .get_mut(&service_id(service))
            .ok_or_else(|| IpvsError::NotFound(service.to_string()))?;
        let pos = entry
            .destinations
            .iter()
            .position(|d| d.endpoint() == destination.endpoint())
            .ok_or_else(|| IpvsError::NotFound(destination.to_string()))?;
        entry.destinations.remove(pos);
        Ok(())
    }

    fn list_services(&mut self) -> Result<Vec<Service>> {
        let mut inner = self.lock();
        inner.record(Op::ListServices, Fault::ListServices)?;
        Ok(inner
            .services
            .values()
            .map(|e| e.service.clone())
            .collect())
    }

    fn get_service(&mut self, service: &Service) -> Result<ServiceEntry> {
        let mut inner = self.lock();
        inner.record(
            Op::GetService(service_id(service)),
            Fault::GetService(service_id(service)),
        )?;
        inner
            .services
            .get(&service_id(service))
            .cloned()
            .ok_or_else(|| IpvsError::NotFound(service.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Op::Flush, Fault::Flush)?;
        inner.services.clear();
        Ok(())
    }
}

pub fn service_id(service: &Service) -> ServiceId {
    (service.protocol, service.addr())
}

/// The service as the kernel would report it back.
fn kernel_service(service: &Service) -> Service {
    Service::new(
        service.host,
        service.port,
        service.protocol,
        service.scheduler.clone(),
    )
}

/// The destination as the kernel would report it back.
fn kernel_destination(destination: &Destination) -> Destination {
    Destination::new(
        destination.host,
        destination.port,
        destination.weight,
        destination.mode,
    )
}
