//! Reconciler error types.

use std::fmt;
use thiserror::Error;

use crate::ipvs::IpvsError;
use crate::state::StateError;

/// IPVS primitive that failed during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddService,
    DeleteService,
    AddDestination,
    DeleteDestination,
    ListServices,
    GetService,
    Flush,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::AddService => "add service",
            Operation::DeleteService => "delete service",
            Operation::AddDestination => "add destination",
            Operation::DeleteDestination => "delete destination",
            Operation::ListServices => "list services",
            Operation::GetService => "get service",
            Operation::Flush => "flush",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the reconciler.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel facility could not be brought up. Fatal to startup.
    #[error("IPVS bootstrap failed: {0}")]
    Bootstrap(#[source] IpvsError),

    /// An IPVS call failed; the rest of the pass was skipped.
    #[error("Failed to {op} {target}: {source}")]
    Ipvs {
        op: Operation,
        target: String,
        #[source]
        source: IpvsError,
    },

    /// The desired state snapshot could not be read; nothing was changed.
    #[error("Failed to read desired state: {0}")]
    State(#[from] StateError),
}

impl Error {
    pub(crate) fn ipvs(op: Operation, target: impl fmt::Display, source: IpvsError) -> Self {
        Self::Ipvs {
            op,
            target: target.to_string(),
            source,
        }
    }

    /// The failed operation, if the error came from an IPVS call.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Error::Ipvs { op, .. } => Some(*op),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
