//! Reconciliation engine.
//!
//! A [`Reconciler`] owns the IPVS table handle and converges it to a
//! [`DesiredState`] snapshot in passes:
//!
//! 1. diff desired services against the kernel and add/remove services
//! 2. for every desired service, diff and apply its destinations
//!
//! The destination pass runs for every service, including those the service
//! pass left alone, so destination drift on an otherwise unchanged service is
//! repaired too.
//!
//! A failed call aborts the pass without rolling back what was already
//! applied. The next pass re-diffs against whatever state is left, so calling
//! [`Reconciler::sync`] again is the recovery path.

use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::diff::diff;
use crate::error::{Error, Operation, Result};
use crate::ipvs::IpvsTable;
use crate::normalize::adopt_local_modes;
use crate::state::DesiredState;
use crate::types::{Destination, Service};

/// Changes applied by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub services_added: usize,
    pub services_removed: usize,
    pub destinations_added: usize,
    pub destinations_removed: usize,
}

impl SyncReport {
    /// True when the table was already converged.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Single writer of the kernel IPVS table.
///
/// All passes are serialized on an instance-scoped lock held for the whole
/// pass, so two passes never interleave their kernel mutations. Callers that
/// arrive while a pass is running block and then run a full pass of their own.
pub struct Reconciler<T> {
    table: Mutex<T>,
}

impl<T: IpvsTable> Reconciler<T> {
    /// Bring up the kernel facility and flush the table.
    ///
    /// This is the only way to obtain a reconciler, so every pass starts from
    /// a table this process has emptied.
    pub fn initialize(mut table: T) -> Result<Self> {
        table.init().map_err(Error::Bootstrap)?;
        table.flush().map_err(Error::Bootstrap)?;
        info!("IPVS table initialized and flushed");

        Ok(Self {
            table: Mutex::new(table),
        })
    }

    /// Remove every service and destination from the table.
    pub fn flush(&self) -> Result<()> {
        let mut table = self.lock();
        table
            .flush()
            .map_err(|e| Error::ipvs(Operation::Flush, "IPVS table", e))?;
        info!("IPVS table flushed");
        Ok(())
    }

    /// Converge the kernel table to `desired`.
    pub fn sync(&self, desired: &DesiredState) -> Result<SyncReport> {
        let mut table = self.lock();
        let table = &mut *table;
        debug!(services = desired.len(), "Syncing IPVS table");

        let mut report = SyncReport::default();

        let current = table
            .list_services()
            .map_err(|e| Error::ipvs(Operation::ListServices, "IPVS table", e))?;
        let changes = diff(desired.services(), &current);

        // A removal on the same endpoint as an addition (scheduler change)
        // has to go first, the kernel holds one service per endpoint.
        let (replaced, removed): (Vec<&Service>, Vec<&Service>) =
            changes.to_remove.into_iter().partition(|old| {
                changes
                    .to_add
                    .iter()
                    .any(|new| new.endpoint() == old.endpoint())
            });

        for service in replaced {
            delete_service(table, service)?;
            report.services_removed += 1;
        }

        for service in &changes.to_add {
            table
                .add_service(service)
                .map_err(|e| Error::ipvs(Operation::AddService, service, e))?;
            report.services_added += 1;
            debug!(service = %service, "Added service");

            for destination in desired.destinations(service) {
                add_destination(table, service, destination)?;
                report.destinations_added += 1;
            }
        }

        for service in removed {
            delete_service(table, service)?;
            report.services_removed += 1;
        }

        for service in desired.services() {
            sync_destinations(table, service, desired.destinations(service), &mut report)?;
        }

        if !report.is_noop() {
            info!(
                services_added = report.services_added,
                services_removed = report.services_removed,
                destinations_added = report.destinations_added,
                destinations_removed = report.destinations_removed,
                "IPVS table synced"
            );
        }

        Ok(report)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A poisoned table is no worse than a partially applied pass
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Converge the destinations of one service.
fn sync_destinations<T: IpvsTable>(
    table: &mut T,
    service: &Service,
    desired: &[Destination],
    report: &mut SyncReport,
) -> Result<()> {
    let mut live = table
        .get_service(service)
        .map_err(|e| Error::ipvs(Operation::GetService, service, e))?
        .destinations;
    adopt_local_modes(&mut live, desired);
    let changes = diff(desired, &live);
    if changes.is_empty() {
        return Ok(());
    }

    // Weight or forwarding changes keep the endpoint; drop the old entry first
    let (replaced, removed): (Vec<&Destination>, Vec<&Destination>) =
        changes.to_remove.into_iter().partition(|old| {
            changes
                .to_add
                .iter()
                .any(|new| new.endpoint() == old.endpoint())
        });

    for destination in replaced {
        delete_destination(table, service, destination)?;
        report.destinations_removed += 1;
    }

    for destination in &changes.to_add {
        add_destination(table, service, destination)?;
        report.destinations_added += 1;
    }

    for destination in removed {
        delete_destination(table, service, destination)?;
        report.destinations_removed += 1;
    }

    Ok(())
}

fn delete_service<T: IpvsTable>(table: &mut T, service: &Service) -> Result<()> {
    table
        .delete_service(service)
        .map_err(|e| Error::ipvs(Operation::DeleteService, service, e))?;
    debug!(service = %service, "Removed service");
    Ok(())
}

fn add_destination<T: IpvsTable>(
    table: &mut T,
    service: &Service,
    destination: &Destination,
) -> Result<()> {
    table
        .add_destination(service, destination)
        .map_err(|e| Error::ipvs(Operation::AddDestination, destination, e))?;
    debug!(service = %service, destination = %destination, "Added destination");
    Ok(())
}

fn delete_destination<T: IpvsTable>(
    table: &mut T,
    service: &Service,
    destination: &Destination,
) -> Result<()> {
    table
        .delete_destination(service, destination)
        .map_err(|e| Error::ipvs(Operation::DeleteDestination, destination, e))?;
    debug!(service = %service, destination = %destination, "Removed destination");
    Ok(())
}
