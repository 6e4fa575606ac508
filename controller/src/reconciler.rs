//! Maps a Node's `MaintenanceScheduled` condition onto cordon, drain and uncordon operations.
//!
//! Reconciliation is level-triggered: the Node is read fresh on every invocation and each step is skipped when the
//! Node is already in the state it would produce, so running it repeatedly without a change mutates nothing.
use crate::error::{self, Error, Result};
use models::maintenance::{maintenance_condition, MaintenanceReason};
use models::node::{DrainOptions, NodeMaintenanceClient};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

const CORDON_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What the controller does for a Node in a given state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MaintenanceAction {
    /// The Node carries no maintenance condition at all.
    Unmanaged,
    /// No maintenance and the Node is already schedulable.
    NoAction,
    Uncordon,
    /// A freeze is a short pause which doesn't justify moving workloads.
    Hold,
    CordonAndDrain { already_cordoned: bool },
    /// The reason is not one we know how to act on.
    Ignore(String),
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Determines the action for `node` from its current condition and schedulability.
pub fn determine_action(node: &Node) -> MaintenanceAction {
    let condition = match maintenance_condition(node) {
        Some(condition) => condition,
        None => return MaintenanceAction::Unmanaged,
    };
    let unschedulable = is_unschedulable(node);

    match condition.reason {
        MaintenanceReason::None if unschedulable => MaintenanceAction::Uncordon,
        MaintenanceReason::None => MaintenanceAction::NoAction,
        MaintenanceReason::Freeze => MaintenanceAction::Hold,
        reason if reason.requires_drain() => MaintenanceAction::CordonAndDrain {
            already_cordoned: unschedulable,
        },
        reason => MaintenanceAction::Ignore(reason.to_string()),
    }
}

/// Shared state for every reconciliation.
pub struct Context<T: NodeMaintenanceClient> {
    node_client: T,
    drain_options: DrainOptions,
}

impl<T: NodeMaintenanceClient> Context<T> {
    pub fn new(node_client: T, drain_options: DrainOptions) -> Self {
        Context {
            node_client,
            drain_options,
        }
    }
}

/// Reconciles a single Node.
#[instrument(skip(node, ctx), fields(node = %node.name_any()), err)]
pub async fn reconcile<T: NodeMaintenanceClient>(
    node: Arc<Node>,
    ctx: Arc<Context<T>>,
) -> Result<Action> {
    let node_name = node
        .metadata
        .name
        .as_deref()
        .context(error::MissingNodeNameSnafu)?;

    match determine_action(&node) {
        MaintenanceAction::Unmanaged => {
            event!(Level::DEBUG, "Node has no maintenance condition.");
        }
        MaintenanceAction::NoAction => {
            event!(Level::TRACE, "No maintenance scheduled.");
        }
        MaintenanceAction::Uncordon => {
            event!(Level::INFO, "Maintenance is over, uncordoning node.");
            ctx.node_client
                .uncordon_node(node_name)
                .await
                .context(error::UncordonSnafu { node_name })?;
        }
        MaintenanceAction::Hold => {
            event!(Level::INFO, "Node is scheduled to be frozen. Leaving workloads in place.");
        }
        MaintenanceAction::CordonAndDrain { already_cordoned } => {
            if !already_cordoned {
                event!(Level::INFO, "Maintenance scheduled, cordoning node.");
                ctx.node_client
                    .cordon_node(node_name)
                    .await
                    .context(error::CordonSnafu { node_name })?;
            }

            event!(Level::INFO, "Draining node.");
            // The node stays cordoned. A failed drain is retried only once the Node changes again.
            match ctx
                .node_client
                .drain_node(node_name, &ctx.drain_options)
                .await
            {
                Ok(()) => event!(Level::INFO, "Node drained."),
                Err(err) => event!(Level::ERROR, %err, "Failed to drain node."),
            }
        }
        MaintenanceAction::Ignore(reason) => {
            event!(Level::WARN, %reason, "Ignoring unrecognized maintenance reason.");
        }
    }

    Ok(Action::await_change())
}

/// Requeues Nodes whose cordon state could not be changed.
pub fn error_policy<T: NodeMaintenanceClient>(
    node: Arc<Node>,
    error: &Error,
    _ctx: Arc<Context<T>>,
) -> Action {
    event!(Level::WARN, node = %node.name_any(), %error, "Reconciliation failed.");
    match error {
        Error::MissingNodeName => Action::await_change(),
        Error::Cordon { .. } | Error::Uncordon { .. } => Action::requeue(CORDON_RETRY_DELAY),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use maplit::btreemap;
    use mockall::Sequence;
    use models::node::drain::error::DrainError;
    use models::node::{MockNodeMaintenanceClient, NodeMaintenanceError};

    const NODE_NAME: &str = "aks-nodepool1-vmss000027";

    fn node(reason: Option<&str>, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(NODE_NAME.to_string()),
                labels: Some(btreemap! {
                    "kubernetes.io/hostname".to_string() => NODE_NAME.to_string(),
                }),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: reason.map(|reason| {
                    vec![NodeCondition {
                        type_: "MaintenanceScheduled".to_string(),
                        status: if reason == "None" { "False" } else { "True" }.to_string(),
                        reason: Some(reason.to_string()),
                        message: Some("Scheduled by the platform.".to_string()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    fn context(node_client: MockNodeMaintenanceClient) -> Arc<Context<MockNodeMaintenanceClient>> {
        Arc::new(Context::new(node_client, DrainOptions::default()))
    }

    #[test]
    fn test_determine_action() {
        let test_cases = vec![
            (node(None, false), MaintenanceAction::Unmanaged),
            (node(Some("None"), false), MaintenanceAction::NoAction),
            (node(Some("None"), true), MaintenanceAction::Uncordon),
            (node(Some("Freeze"), false), MaintenanceAction::Hold),
            (
                node(Some("Reboot"), false),
                MaintenanceAction::CordonAndDrain {
                    already_cordoned: false,
                },
            ),
            (
                node(Some("Terminate"), true),
                MaintenanceAction::CordonAndDrain {
                    already_cordoned: true,
                },
            ),
            (
                node(Some("LiveMigrate"), false),
                MaintenanceAction::Ignore("LiveMigrate".to_string()),
            ),
        ];

        for (node, expected) in test_cases {
            assert_eq!(determine_action(&node), expected);
        }
    }

    #[test]
    fn test_true_condition_reading_none_is_not_uncordoned() {
        let mut node = node(Some("None"), true);
        if let Some(conditions) = node.status.as_mut().and_then(|status| status.conditions.as_mut()) {
            conditions[0].status = "True".to_string();
        }
        assert_eq!(
            determine_action(&node),
            MaintenanceAction::Ignore("None".to_string())
        );
    }

    #[test]
    fn test_missing_spec_is_schedulable() {
        let mut node = node(Some("None"), false);
        node.spec = None;
        assert_eq!(determine_action(&node), MaintenanceAction::NoAction);
    }

    #[tokio::test]
    async fn test_reboot_cordons_then_drains() {
        let mut seq = Sequence::new();
        let mut node_client = MockNodeMaintenanceClient::new();
        node_client
            .expect_cordon_node()
            .withf(|node_name| node_name == NODE_NAME)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        node_client
            .expect_drain_node()
            .withf(|node_name, options| node_name == NODE_NAME && options.force)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        node_client.expect_uncordon_node().never();

        let action = reconcile(Arc::new(node(Some("Reboot"), false)), context(node_client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_drain_failure_is_not_surfaced() {
        let mut node_client = MockNodeMaintenanceClient::new();
        node_client
            .expect_cordon_node()
            .times(1)
            .returning(|_| Ok(()));
        node_client
            .expect_drain_node()
            .times(1)
            .returning(|node_name, _| {
                Err(NodeMaintenanceError::DrainNode {
                    source: DrainError::EvictionsFailed {
                        node_name: node_name.to_string(),
                        pod_names: vec!["web-5d4f8".to_string()],
                    },
                    node_name: node_name.to_string(),
                })
            });
        node_client.expect_uncordon_node().never();

        let action = reconcile(Arc::new(node(Some("Preempt"), false)), context(node_client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_already_cordoned_node_is_only_drained() {
        let mut node_client = MockNodeMaintenanceClient::new();
        node_client.expect_cordon_node().never();
        node_client
            .expect_drain_node()
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(node(Some("Redeploy"), true)), context(node_client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_maintenance_uncordons() {
        let mut node_client = MockNodeMaintenanceClient::new();
        node_client
            .expect_uncordon_node()
            .withf(|node_name| node_name == NODE_NAME)
            .times(1)
            .returning(|_| Ok(()));
        node_client.expect_cordon_node().never();
        node_client.expect_drain_node().never();

        reconcile(Arc::new(node(Some("None"), true)), context(node_client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_mutation_without_work() {
        for node in [
            node(Some("None"), false),
            node(Some("Freeze"), false),
            node(Some("LiveMigrate"), true),
            node(None, true),
        ] {
            let mut node_client = MockNodeMaintenanceClient::new();
            node_client.expect_cordon_node().never();
            node_client.expect_uncordon_node().never();
            node_client.expect_drain_node().never();

            let action = reconcile(Arc::new(node), context(node_client))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    #[tokio::test]
    async fn test_cordon_failure_is_requeued() {
        let mut node_client = MockNodeMaintenanceClient::new();
        node_client.expect_cordon_node().times(1).returning(|node_name| {
            Err(NodeMaintenanceError::CordonNode {
                source: kube::Error::LinesCodecMaxLineLengthExceeded,
                node_name: node_name.to_string(),
            })
        });
        node_client.expect_drain_node().never();

        let ctx = context(node_client);
        let node = Arc::new(node(Some("Reboot"), false));
        let err = reconcile(node.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Cordon { .. }));
        assert_eq!(
            error_policy(node, &err, ctx),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn test_nameless_node_is_rejected() {
        let mut node = node(Some("Reboot"), false);
        node.metadata.name = None;
        let ctx = context(MockNodeMaintenanceClient::new());
        let err = reconcile(Arc::new(node.clone()), ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingNodeName));
        assert_eq!(
            error_policy(Arc::new(node), &err, ctx),
            Action::await_change()
        );
    }
}
