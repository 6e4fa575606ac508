//! The maintenance data model shared by the node agent and the controller.
//!
//! The infrastructure platform announces upcoming interruptions as a versioned feed of scheduled events
//! ([`EventDocument`]). The agent collapses that feed into a single [`MaintenanceCondition`] which is
//! published on the Node object, and the controller maps the condition's [`MaintenanceReason`] to
//! cordon/drain actions.
mod condition;
mod events;

pub use self::condition::*;
pub use self::events::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of maintenance announced for a node.
///
/// Known platform event types are modeled explicitly. Anything else the platform sends is preserved verbatim in
/// `Unknown` so that it can be reported and deliberately ignored.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MaintenanceReason {
    /// No maintenance is scheduled.
    None,
    /// The VM is paused for a few seconds. Memory, open files and network connections are preserved.
    Freeze,
    /// The VM is rebooted. Memory is lost.
    Reboot,
    /// The VM is moved to another host. Ephemeral disks are lost.
    Redeploy,
    /// A spot VM is being evicted.
    Preempt,
    /// The VM is being deleted.
    Terminate,
    Unknown(String),
}

impl MaintenanceReason {
    /// Ranks reasons by how disruptive the interruption is to workloads running on the node.
    pub fn severity(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Unknown(_) => 1,
            Self::Freeze => 2,
            Self::Reboot => 3,
            Self::Redeploy => 4,
            Self::Preempt => 5,
            Self::Terminate => 6,
        }
    }

    /// Whether workloads must be moved off the node before the interruption happens.
    pub fn requires_drain(&self) -> bool {
        matches!(
            self,
            Self::Reboot | Self::Redeploy | Self::Preempt | Self::Terminate
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => crate::constants::NO_MAINTENANCE_REASON,
            Self::Freeze => "Freeze",
            Self::Reboot => "Reboot",
            Self::Redeploy => "Redeploy",
            Self::Preempt => "Preempt",
            Self::Terminate => "Terminate",
            Self::Unknown(reason) => reason,
        }
    }
}

impl From<&str> for MaintenanceReason {
    fn from(reason: &str) -> Self {
        match reason {
            crate::constants::NO_MAINTENANCE_REASON => Self::None,
            "Freeze" => Self::Freeze,
            "Reboot" => Self::Reboot,
            "Redeploy" => Self::Redeploy,
            "Preempt" => Self::Preempt,
            "Terminate" => Self::Terminate,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for MaintenanceReason {
    fn from(reason: String) -> Self {
        Self::from(reason.as_str())
    }
}

impl From<MaintenanceReason> for String {
    fn from(reason: MaintenanceReason) -> Self {
        match reason {
            MaintenanceReason::Unknown(reason) => reason,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MaintenanceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
