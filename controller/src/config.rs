use models::node::DrainOptions;

use snafu::ResultExt;
use std::env;
use std::time::Duration;

const DRAIN_TIMEOUT_ENV_VAR: &str = "DRAIN_TIMEOUT_SECONDS";
const DEFAULT_DRAIN_TIMEOUT_SECONDS: u64 = 60;

/// Controller settings, read from the environment of the Deployment pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub drain_timeout: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let drain_timeout = match env::var(DRAIN_TIMEOUT_ENV_VAR) {
            Ok(value) => value
                .parse::<u64>()
                .map(Duration::from_secs)
                .context(config_error::DrainTimeoutSnafu { env_value: &value })?,
            Err(_) => Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECONDS),
        };
        Ok(ControllerConfig { drain_timeout })
    }

    /// Options handed to every drain. Each Pod keeps its own termination grace period.
    pub fn drain_options(&self) -> DrainOptions {
        DrainOptions {
            timeout: self.drain_timeout,
            ..Default::default()
        }
    }
}

pub type Result<T> = std::result::Result<T, config_error::Error>;

pub mod config_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Could not parse seconds from environment variable '{}={}': '{}'",
            DRAIN_TIMEOUT_ENV_VAR,
            env_value,
            source
        ))]
        DrainTimeout {
            source: std::num::ParseIntError,
            env_value: String,
        },
    }
}
