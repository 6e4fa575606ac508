use models::constants::{NODE_EVENT_NAMESPACE, NODE_EVENT_SOURCE};
use models::maintenance::{MaintenanceCondition, ScheduledEvent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::json;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

const EVENT_TYPE_WARNING: &str = "Warning";

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, exporter_error::Error>;

#[async_trait]
/// Makes the maintenance state of this node observable in the cluster.
pub trait ConditionExporter: Send + Sync {
    /// Overwrites the node's `MaintenanceScheduled` condition.
    async fn export_condition(
        &self,
        condition: &MaintenanceCondition,
        heartbeat_time: DateTime<Utc>,
    ) -> Result<()>;
    /// Records one problem report per scheduled event.
    async fn export_problems(&self, events: &[ScheduledEvent], now: DateTime<Utc>) -> Result<()>;
}

/// Exports the condition onto the Node's status and the problems as Node Events.
#[derive(Clone)]
pub struct K8SConditionExporter {
    k8s_client: kube::client::Client,
    node_name: String,
}

impl K8SConditionExporter {
    pub fn new(k8s_client: kube::client::Client, node_name: String) -> Self {
        K8SConditionExporter {
            k8s_client,
            node_name,
        }
    }
}

#[async_trait]
impl ConditionExporter for K8SConditionExporter {
    #[instrument(skip(self), fields(node = %self.node_name), err)]
    async fn export_condition(
        &self,
        condition: &MaintenanceCondition,
        heartbeat_time: DateTime<Utc>,
    ) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        // Node conditions are merged by `type`, so this replaces only our own condition.
        let patch = json!({
            "status": {
                "conditions": [condition.to_node_condition(heartbeat_time)]
            }
        });
        nodes
            .patch_status(
                &self.node_name,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await
            .context(exporter_error::PatchNodeConditionSnafu {
                node_name: &self.node_name,
            })?;

        event!(Level::INFO, reason = %condition.reason, "Exported maintenance condition.");
        Ok(())
    }

    #[instrument(skip(self, events), fields(node = %self.node_name, count = events.len()), err)]
    async fn export_problems(&self, events: &[ScheduledEvent], now: DateTime<Utc>) -> Result<()> {
        let k8s_events: Api<Event> =
            Api::namespaced(self.k8s_client.clone(), NODE_EVENT_NAMESPACE);
        for scheduled in events {
            k8s_events
                .create(
                    &PostParams::default(),
                    &node_event(&self.node_name, scheduled, now),
                )
                .await
                .context(exporter_error::CreateNodeEventSnafu {
                    node_name: &self.node_name,
                    event_id: &scheduled.event_id,
                })?;
        }
        Ok(())
    }
}

/// Builds the Kubernetes Event reporting a scheduled event on the given Node.
fn node_event(node_name: &str, scheduled: &ScheduledEvent, now: DateTime<Utc>) -> Event {
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", node_name)),
            namespace: Some(NODE_EVENT_NAMESPACE.to_string()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Node".to_string()),
            name: Some(node_name.to_string()),
            uid: Some(node_name.to_string()),
            ..Default::default()
        },
        type_: Some(EVENT_TYPE_WARNING.to_string()),
        reason: Some(scheduled.event_type.to_string()),
        message: Some(scheduled.description.clone()),
        source: Some(EventSource {
            component: Some(NODE_EVENT_SOURCE.to_string()),
            host: Some(node_name.to_string()),
        }),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    }
}

pub mod exporter_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unable to update MaintenanceScheduled condition of Node '{}': '{}'",
            node_name,
            source
        ))]
        PatchNodeCondition {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display(
            "Unable to record scheduled event '{}' for Node '{}': '{}'",
            event_id,
            node_name,
            source
        ))]
        CreateNodeEvent {
            source: kube::Error,
            node_name: String,
            event_id: String,
        },
    }
}
