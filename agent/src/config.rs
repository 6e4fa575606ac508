use crate::metadata::DEFAULT_METADATA_ENDPOINT;
use crate::poller::PollerSettings;
use models::constants::NODE_NAME_ENV_VAR;
use models::maintenance::MergePolicy;

use snafu::{ensure, OptionExt, ResultExt};
use std::env;
use std::time::Duration;

const METADATA_ENDPOINT_ENV_VAR: &str = "METADATA_ENDPOINT";
const POLL_INTERVAL_ENV_VAR: &str = "POLL_INTERVAL_SECONDS";
const ACK_GRACE_PERIOD_ENV_VAR: &str = "ACK_GRACE_PERIOD_SECONDS";
const METADATA_TIMEOUT_ENV_VAR: &str = "METADATA_TIMEOUT_SECONDS";
const CONDITION_HEARTBEAT_ENV_VAR: &str = "CONDITION_HEARTBEAT_SECONDS";
const CONDITION_MERGE_POLICY_ENV_VAR: &str = "CONDITION_MERGE_POLICY";

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_ACK_GRACE_PERIOD_SECONDS: u64 = 60;
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_CONDITION_HEARTBEAT_SECONDS: u64 = 300;

/// Agent settings, read from the environment of the DaemonSet pod.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub node_name: String,
    pub metadata_endpoint: String,
    pub metadata_timeout: Duration,
    pub poller: PollerSettings,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let node_name = env::var(NODE_NAME_ENV_VAR)
            .ok()
            .filter(|name| !name.is_empty())
            .context(config_error::MissingNodeNameSnafu)?;
        let metadata_endpoint = env::var(METADATA_ENDPOINT_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_METADATA_ENDPOINT.to_string());

        let merge_policy = env::var(CONDITION_MERGE_POLICY_ENV_VAR)
            .ok()
            .map(|policy| {
                serde_plain::from_str::<MergePolicy>(&policy.to_lowercase())
                    .context(config_error::MergePolicySnafu { env_value: policy })
            })
            .transpose()?
            .unwrap_or_default();

        let ack_grace_period =
            seconds_from_env(ACK_GRACE_PERIOD_ENV_VAR, DEFAULT_ACK_GRACE_PERIOD_SECONDS)?;
        let heartbeat_period = seconds_from_env(
            CONDITION_HEARTBEAT_ENV_VAR,
            DEFAULT_CONDITION_HEARTBEAT_SECONDS,
        )?;
        // The condition is exported at most once per grace period.
        ensure!(
            heartbeat_period >= ack_grace_period,
            config_error::HeartbeatWithinGracePeriodSnafu {
                heartbeat_period,
                ack_grace_period,
            }
        );

        Ok(AgentConfig {
            node_name,
            metadata_endpoint,
            metadata_timeout: seconds_from_env(
                METADATA_TIMEOUT_ENV_VAR,
                DEFAULT_METADATA_TIMEOUT_SECONDS,
            )?,
            poller: PollerSettings {
                poll_interval: seconds_from_env(
                    POLL_INTERVAL_ENV_VAR,
                    DEFAULT_POLL_INTERVAL_SECONDS,
                )?,
                ack_grace_period,
                heartbeat_period,
                merge_policy,
            },
        })
    }
}

fn seconds_from_env(env_var: &'static str, default: u64) -> Result<Duration> {
    let seconds = match env::var(env_var) {
        Ok(value) => value
            .parse::<u64>()
            .context(config_error::DurationSnafu {
                env_var,
                env_value: value.clone(),
            })?,
        Err(_) => default,
    };
    if seconds == 0 {
        return config_error::ZeroDurationSnafu { env_var }.fail();
    }
    Ok(Duration::from_secs(seconds))
}

pub type Result<T> = std::result::Result<T, config_error::Error>;

pub mod config_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Environment variable '{}' must name the Node this agent runs on.",
            NODE_NAME_ENV_VAR
        ))]
        MissingNodeName,

        #[snafu(display(
            "Could not parse seconds from environment variable '{}={}': '{}'",
            env_var,
            env_value,
            source
        ))]
        Duration {
            source: std::num::ParseIntError,
            env_var: &'static str,
            env_value: String,
        },

        #[snafu(display("Environment variable '{}' must be greater than zero.", env_var))]
        ZeroDuration { env_var: &'static str },

        #[snafu(display(
            "'{}' ({}s) must not be shorter than '{}' ({}s).",
            CONDITION_HEARTBEAT_ENV_VAR,
            heartbeat_period.as_secs(),
            ACK_GRACE_PERIOD_ENV_VAR,
            ack_grace_period.as_secs()
        ))]
        HeartbeatWithinGracePeriod {
            heartbeat_period: std::time::Duration,
            ack_grace_period: std::time::Duration,
        },

        #[snafu(display(
            "Could not parse merge policy from environment variable '{}={}': '{}'",
            CONDITION_MERGE_POLICY_ENV_VAR,
            env_value,
            source
        ))]
        MergePolicy {
            source: serde_plain::Error,
            env_value: String,
        },
    }
}
