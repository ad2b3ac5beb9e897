//! Desired state: the provider boundary and the per-pass snapshot.
//!
//! A [`StateProvider`] is the source of truth for which virtual services
//! should exist. The reconciler never reads it directly; each pass works on a
//! [`DesiredState`] snapshot taken through [`DesiredState::load`], which also
//! applies the [`HealthFilter`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::normalize::{Normalize, ServiceKey};
use crate::types::{Destination, ForwardMode, Service, ServiceEntry};

/// Desired state errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate service {0}")]
    DuplicateService(String),

    #[error("Duplicate destination {destination} in service {service}")]
    DuplicateDestination {
        service: String,
        destination: String,
    },

    #[error("Invalid service {service}: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("Invalid destination {destination} in service {service}: {reason}")]
    InvalidDestination {
        service: String,
        destination: String,
        reason: String,
    },

    #[error("State provider error: {0}")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// IPVS schedulers known to the kernel.
pub const SCHEDULERS: &[&str] = &[
    "rr", "wrr", "lc", "wlc", "lblc", "lblcr", "dh", "sh", "sed", "nq", "fo", "ovf", "mh",
];

/// Largest weight `ipvsadm` accepts.
pub const MAX_WEIGHT: u32 = 65535;

/// Source of desired services and destinations.
///
/// Implementations must return fully materialized values and own their own
/// concurrency control.
pub trait StateProvider {
    fn services(&self) -> Result<Vec<Service>>;

    fn destinations(&self, service: &Service) -> Result<Vec<Destination>>;
}

/// Decides which desired destinations are eligible for the kernel table.
pub trait HealthFilter {
    fn filter_healthy(&self, service: &Service, destinations: Vec<Destination>)
    -> Vec<Destination>;
}

/// Health filter that passes every destination through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllHealthy;

impl HealthFilter for AllHealthy {
    fn filter_healthy(&self, _: &Service, destinations: Vec<Destination>) -> Vec<Destination> {
        destinations
    }
}

/// Immutable snapshot of the desired services and their destinations.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    entries: Vec<ServiceEntry>,
    index: HashMap<ServiceKey, usize>,
}

impl DesiredState {
    /// Build a snapshot, rejecting services or destinations the kernel could
    /// not hold side by side.
    pub fn new(entries: Vec<ServiceEntry>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        let mut endpoints = HashMap::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            validate_service(&entry.service)?;

            if endpoints.insert(entry.service.endpoint(), i).is_some() {
                return Err(StateError::DuplicateService(entry.service.to_string()));
            }
            index.insert(entry.service.normalized(), i);

            let mut seen = HashSet::with_capacity(entry.destinations.len());
            for destination in &entry.destinations {
                validate_destination(&entry.service, destination)?;
                if !seen.insert(destination.endpoint()) {
                    return Err(StateError::DuplicateDestination {
                        service: entry.service.to_string(),
                        destination: destination.to_string(),
                    });
                }
            }
        }

        Ok(Self { entries, index })
    }

    /// Take a snapshot from a provider, filtering destinations through `filter`.
    pub fn load(provider: &dyn StateProvider, filter: &dyn HealthFilter) -> Result<Self> {
        let services = provider.services()?;
        let mut entries = Vec::with_capacity(services.len());

        for service in services {
            let destinations = provider.destinations(&service)?;
            let total = destinations.len();
            let healthy = filter.filter_healthy(&service, destinations);
            if healthy.len() != total {
                debug!(
                    service = %service,
                    healthy = healthy.len(),
                    total,
                    "Filtered unhealthy destinations"
                );
            }
            entries.push(ServiceEntry::new(service, healthy));
        }

        Self::new(entries)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.entries.iter().map(|e| &e.service)
    }

    /// Desired destinations of `service`, matched under normalized equality.
    pub fn destinations(&self, service: &Service) -> &[Destination] {
        self.index
            .get(&service.normalized())
            .map(|&i| self.entries[i].destinations.as_slice())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateProvider for DesiredState {
    fn services(&self) -> Result<Vec<Service>> {
        Ok(DesiredState::services(self).cloned().collect())
    }

    fn destinations(&self, service: &Service) -> Result<Vec<Destination>> {
        Ok(DesiredState::destinations(self, service).to_vec())
    }
}

fn validate_service(service: &Service) -> Result<()> {
    if !SCHEDULERS.contains(&service.scheduler.as_str()) {
        return Err(StateError::InvalidService {
            service: service.to_string(),
            reason: format!("unknown scheduler '{}'", service.scheduler),
        });
    }
    if service.port == 0 {
        return Err(StateError::InvalidService {
            service: service.to_string(),
            reason: "port must not be 0".to_string(),
        });
    }
    Ok(())
}

fn validate_destination(service: &Service, destination: &Destination) -> Result<()> {
    let reason = if destination.weight > MAX_WEIGHT {
        format!("weight {} exceeds {MAX_WEIGHT}", destination.weight)
    } else if destination.mode == ForwardMode::Local {
        "local mode is chosen by the kernel and can't be requested".to_string()
    } else {
        return Ok(());
    };

    Err(StateError::InvalidDestination {
        service: service.to_string(),
        destination: destination.to_string(),
        reason,
    })
}

/// On-disk layout of the desired state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// A service as written in the state file, with its destinations nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(flatten)]
    pub service: Service,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// [`StateProvider`] reading a JSON state file.
///
/// ```json
/// {
///   "services": [{
///     "name": "web", "host": "10.8.0.1", "port": 80,
///     "protocol": "tcp", "scheduler": "rr", "mode": "nat",
///     "destinations": [{ "name": "web-1", "host": "10.0.0.1", "port": 8080, "weight": 1 }]
///   }]
/// }
/// ```
///
/// The file is read once in [`FileState::load`]; load again to pick up changes.
#[derive(Debug, Clone)]
pub struct FileState {
    path: PathBuf,
    file: StateFile,
}

impl FileState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.clone(),
            source,
        })?;
        let file = serde_json::from_str(&data).map_err(|source| StateError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateProvider for FileState {
    fn services(&self) -> Result<Vec<Service>> {
        Ok(self.file.services.iter().map(|s| s.service.clone()).collect())
    }

    fn destinations(&self, service: &Service) -> Result<Vec<Destination>> {
        let key = service.normalized();
        let spec = self
            .file
            .services
            .iter()
            .find(|s| s.service.normalized() == key)
            .ok_or_else(|| StateError::Provider(format!("unknown service {service}")))?;

        Ok(spec
            .destinations
            .iter()
            .map(|d| d.clone().with_service_id(spec.service.name.clone()))
            .collect())
    }
}
