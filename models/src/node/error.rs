use super::drain::error::DrainError;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to uncordon Node '{}': '{}'", node_name, source))]
    UncordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to drain Node '{}': '{}'", node_name, source))]
    DrainNode {
        source: DrainError,
        node_name: String,
    },
}
