//! Workload capability tags.
//!
//! Tasks and nodes each carry a [`WorkloadClass`]. A node accepts a task
//! only when their classes are compatible: equal, or either side is
//! [`WorkloadClass::Generic`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Coarse capability category used to restrict placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    /// Wildcard: matches every other class on either side.
    #[default]
    Generic,
    Compute,
    Storage,
    Memory,
    Network,
    Gpu,
}

impl WorkloadClass {
    /// All classes, in declaration order.
    pub const ALL: [WorkloadClass; 6] = [
        WorkloadClass::Generic,
        WorkloadClass::Compute,
        WorkloadClass::Storage,
        WorkloadClass::Memory,
        WorkloadClass::Network,
        WorkloadClass::Gpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Generic => "generic",
            WorkloadClass::Compute => "compute",
            WorkloadClass::Storage => "storage",
            WorkloadClass::Memory => "memory",
            WorkloadClass::Network => "network",
            WorkloadClass::Gpu => "gpu",
        }
    }

    pub fn is_generic(&self) -> bool {
        *self == WorkloadClass::Generic
    }

    /// Class compatibility between a node and a task.
    pub fn is_compatible(&self, other: WorkloadClass) -> bool {
        *self == other || self.is_generic() || other.is_generic()
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        WorkloadClass::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!(
                    "unknown workload class '{s}' (expected one of: generic, compute, storage, memory, network, gpu)"
                ))
            })
    }
}
