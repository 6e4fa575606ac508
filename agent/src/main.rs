use agent::config::AgentConfig;
use agent::error::{self, Result};
use agent::exporter::K8SConditionExporter;
use agent::metadata::{ImdsClient, MetadataClient};
use agent::poller::MaintenancePoller;
use models::constants::{AGENT, DEFAULT_TERMINATION_LOG, TERMINATION_LOG_ENV_VAR};
use models::telemetry;

use snafu::ResultExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use std::env;
use std::fs;
use std::process;

#[tokio::main]
async fn main() {
    let termination_log =
        env::var(TERMINATION_LOG_ENV_VAR).unwrap_or_else(|_| DEFAULT_TERMINATION_LOG.to_string());

    if let Err(error) = run_agent().await {
        event!(Level::ERROR, %error, "Agent failed.");
        if let Err(write_error) = fs::write(&termination_log, format!("{}", error)) {
            event!(Level::ERROR, %write_error, %termination_log, "Could not write termination log.");
        }
        process::exit(1);
    }
}

async fn run_agent() -> Result<()> {
    telemetry::init_telemetry_from_env(AGENT).context(error::TelemetrySnafu)?;
    let config = AgentConfig::from_env().context(error::ConfigurationSnafu)?;
    event!(Level::INFO, ?config, "Starting maintenance agent.");

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    let metadata_client = ImdsClient::new(&config.metadata_endpoint, config.metadata_timeout)
        .context(error::MetadataClientCreateSnafu)?;
    // Without an identity no event can be attributed to this node.
    let vm_name = metadata_client
        .resolve_self()
        .await
        .context(error::ResolveSelfSnafu)?;
    event!(Level::INFO, %vm_name, node = %config.node_name, "Resolved VM identity.");

    let exporter = K8SConditionExporter::new(k8s_client, config.node_name.clone());
    let mut poller = MaintenancePoller::new(metadata_client, exporter, config.poller);

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context(error::SignalHandlerSnafu)?;
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        event!(Level::INFO, "Received termination signal.");
        signal_shutdown.cancel();
    });

    poller.run(shutdown).await.context(error::PollerSnafu)
}
