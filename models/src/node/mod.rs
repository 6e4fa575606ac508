//! Kubernetes Node operations used to move workloads away from a node ahead of maintenance.
mod client;
pub mod drain;
mod error;

pub use self::client::*;
pub use self::drain::DrainOptions;
pub use self::error::Error as NodeMaintenanceError;
pub use self::error::Result;
