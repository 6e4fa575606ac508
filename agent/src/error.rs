use crate::config::config_error;
use crate::metadata::metadata_error;
use crate::poller::poller_error;
use models::telemetry::TelemetryConfigError;
use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to read agent configuration: '{}'", source))]
    Configuration { source: config_error::Error },

    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Unable to create metadata client: '{}'", source))]
    MetadataClientCreate { source: metadata_error::Error },

    #[snafu(display("Unable to identify this VM: '{}'", source))]
    ResolveSelf { source: metadata_error::Error },

    #[snafu(display("Maintenance poller stopped: '{}'", source))]
    Poller { source: poller_error::Error },

    #[snafu(display("Unable to install signal handler: '{}'", source))]
    SignalHandler { source: std::io::Error },

    #[snafu(display("Error configuring telemetry: '{}'", source))]
    Telemetry { source: TelemetryConfigError },
}
