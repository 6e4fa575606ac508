use models::node::NodeMaintenanceError;
use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors which fail a reconciliation. Drain failures are deliberately absent; they are logged and swallowed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Observed a Node without a name."))]
    MissingNodeName,

    #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
    Cordon {
        source: NodeMaintenanceError,
        node_name: String,
    },

    #[snafu(display("Unable to uncordon Node '{}': '{}'", node_name, source))]
    Uncordon {
        source: NodeMaintenanceError,
        node_name: String,
    },
}
