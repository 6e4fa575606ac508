use super::{
    drain::{self, DrainOptions},
    error::{self, Result},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[cfg(feature = "mockall")]
use mockall::mock;

#[async_trait]
/// A trait providing an interface to cordon, uncordon and drain Kubernetes Nodes. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait NodeMaintenanceClient: Clone + Sized + Send + Sync {
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    /// Marks the given node as scheduleable, allowing Pods to be deployed onto it.
    async fn uncordon_node(&self, node_name: &str) -> Result<()>;
    /// Evicts all pods on the given node.
    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock NodeMaintenanceClient for use in tests.
    pub NodeMaintenanceClient {}
    #[async_trait]
    impl NodeMaintenanceClient for NodeMaintenanceClient {
        async fn cordon_node(&self, node_name: &str) -> Result<()>;
        async fn uncordon_node(&self, node_name: &str) -> Result<()>;
        async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()>;
    }

    impl Clone for NodeMaintenanceClient {
        fn clone(&self) -> Self;
    }
}

#[derive(Clone)]
/// Concrete implementation of the `NodeMaintenanceClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SNodeMaintenanceClient {
    k8s_client: kube::client::Client,
    shutdown: CancellationToken,
}

impl K8SNodeMaintenanceClient {
    /// Creates a client whose drains stop evicting Pods once `shutdown` is cancelled.
    pub fn new(k8s_client: kube::client::Client, shutdown: CancellationToken) -> Self {
        K8SNodeMaintenanceClient {
            k8s_client,
            shutdown,
        }
    }
}

#[async_trait]
impl NodeMaintenanceClient for K8SNodeMaintenanceClient {
    #[instrument(skip(self), err)]
    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(node_name)
            .await
            .context(error::CordonNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon_node(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .uncordon(node_name)
            .await
            .context(error::UncordonNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn drain_node(&self, node_name: &str, options: &DrainOptions) -> Result<()> {
        drain::drain_node(&self.k8s_client, node_name, options, &self.shutdown)
            .await
            .context(error::DrainNodeSnafu { node_name })?;
        Ok(())
    }
}
