use controller::config::ControllerConfig;
use controller::{error_policy, reconcile, Context};
use models::constants::{CONTROLLER, DEFAULT_TERMINATION_LOG, TERMINATION_LOG_ENV_VAR};
use models::node::K8SNodeMaintenanceClient;
use models::telemetry;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::{controller::Controller, watcher};
use snafu::ResultExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use std::env;
use std::fs;
use std::process;
use std::sync::Arc;

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

#[tokio::main]
async fn main() {
    let termination_log =
        env::var(TERMINATION_LOG_ENV_VAR).unwrap_or_else(|_| DEFAULT_TERMINATION_LOG.to_string());

    if let Err(error) = run_controller().await {
        event!(Level::ERROR, %error, "Controller failed.");
        if let Err(write_error) = fs::write(&termination_log, format!("{}", error)) {
            event!(Level::ERROR, %write_error, %termination_log, "Could not write termination log.");
        }
        process::exit(1);
    }
}

async fn run_controller() -> Result<()> {
    telemetry::init_telemetry_from_env(CONTROLLER).context(controller_error::TelemetryInitSnafu)?;
    let config = ControllerConfig::from_env().context(controller_error::ConfigurationSnafu)?;
    event!(Level::INFO, ?config, "Starting maintenance controller.");

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(controller_error::ClientCreateSnafu)?;

    // Cancelled on shutdown so that an in-flight drain stops issuing evictions.
    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context(controller_error::SignalHandlerSnafu)?;
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        event!(Level::INFO, "Received termination signal.");
        signal_shutdown.cancel();
    });

    let node_client = K8SNodeMaintenanceClient::new(k8s_client.clone(), shutdown);
    let context = Arc::new(Context::new(node_client, config.drain_options()));

    // The controller runs at most one reconciliation per Node at a time.
    let nodes: Api<Node> = Api::all(k8s_client);
    Controller::new(nodes, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((node, _)) => {
                    event!(Level::DEBUG, node = %node.name, "Reconciled node.");
                }
                Err(err) => {
                    event!(Level::WARN, %err, "Reconciliation error.");
                }
            }
        })
        .await;

    event!(Level::INFO, "Controller stopped.");
    Ok(())
}

pub mod controller_error {
    use controller::config::config_error;
    use models::telemetry::TelemetryConfigError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read controller configuration: '{}'", source))]
        Configuration { source: config_error::Error },

        #[snafu(display("Unable to create client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Unable to install signal handler: '{}'", source))]
        SignalHandler { source: std::io::Error },

        #[snafu(display("Error during telemetry config: '{}'", source))]
        TelemetryInit { source: TelemetryConfigError },
    }
}
