//! mvirt-lb: IPVS control plane for the mvirt L4 load balancer.
//!
//! The kernel IPVS table is kept in sync with a desired set of virtual
//! services by a single reconciler:
//!
//! ```text
//! StateProvider --(snapshot + HealthFilter)--> DesiredState
//!                                                  |
//!                                          Reconciler::sync
//!                                                  |
//!                          diff services --> diff destinations per service
//!                                                  |
//!                                     IpvsTable (ipvsadm / kernel)
//! ```
//!
//! Entities are compared on their kernel-relevant fields only (see
//! [`normalize`]), so provider metadata never causes churn.

pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod ipvs;
pub mod normalize;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use diff::{Diff, diff};
pub use engine::{Reconciler, SyncReport};
pub use error::{Error, Operation, Result};
pub use ipvs::{IpvsAdm, IpvsError, IpvsTable};
pub use normalize::{DestinationKey, Normalize, ServiceKey};
pub use state::{AllHealthy, DesiredState, FileState, HealthFilter, StateError, StateProvider};
pub use types::{Destination, ForwardMode, Protocol, Service, ServiceEntry};
