use super::{EventDocument, MaintenanceReason, ScheduledEvent};
use crate::constants::{
    CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, MAINTENANCE_CONDITION_TYPE,
    NO_MAINTENANCE_MESSAGE,
};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Deserialize;

/// The cluster-visible summary of the maintenance scheduled for a node.
///
/// Exactly one of these is associated with a node. Maintenance is present whenever the reason is anything other than
/// [`MaintenanceReason::None`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MaintenanceCondition {
    pub reason: MaintenanceReason,
    pub message: String,
    pub transition_time: DateTime<Utc>,
}

impl MaintenanceCondition {
    /// A condition stating that no maintenance is scheduled.
    pub fn no_maintenance(now: DateTime<Utc>) -> Self {
        MaintenanceCondition {
            reason: MaintenanceReason::None,
            message: NO_MAINTENANCE_MESSAGE.to_string(),
            transition_time: now,
        }
    }

    pub fn present(&self) -> bool {
        self.reason != MaintenanceReason::None
    }

    /// Renders this condition as the `MaintenanceScheduled` condition of a Node's status.
    pub fn to_node_condition(&self, heartbeat_time: DateTime<Utc>) -> NodeCondition {
        NodeCondition {
            type_: MAINTENANCE_CONDITION_TYPE.to_string(),
            status: if self.present() {
                CONDITION_STATUS_TRUE
            } else {
                CONDITION_STATUS_FALSE
            }
            .to_string(),
            reason: Some(self.reason.to_string()),
            message: Some(self.message.clone()),
            last_transition_time: Some(Time(self.transition_time)),
            last_heartbeat_time: Some(Time(heartbeat_time)),
        }
    }

    /// Reads a condition back from a Node's status.
    ///
    /// Returns `None` if `condition` is not a `MaintenanceScheduled` condition. A condition without a reason is read
    /// as "no maintenance" when its status is `False`, and as an unknown reason otherwise.
    pub fn from_node_condition(condition: &NodeCondition) -> Option<Self> {
        if condition.type_ != MAINTENANCE_CONDITION_TYPE {
            return None;
        }
        let reason = match condition.reason.as_deref() {
            // A `True` condition always carries maintenance, whatever its reason reads.
            Some(reason) if condition.status == CONDITION_STATUS_TRUE => {
                event_reason(&MaintenanceReason::from(reason))
            }
            Some(reason) => MaintenanceReason::from(reason),
            None if condition.status == CONDITION_STATUS_FALSE => MaintenanceReason::None,
            None => MaintenanceReason::Unknown(String::new()),
        };
        Some(MaintenanceCondition {
            reason,
            message: condition.message.clone().unwrap_or_default(),
            transition_time: condition
                .last_transition_time
                .as_ref()
                .map(|time| time.0)
                .unwrap_or_default(),
        })
    }
}

/// Returns the `MaintenanceScheduled` condition of a Node, if it has one.
pub fn maintenance_condition(node: &Node) -> Option<MaintenanceCondition> {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find_map(MaintenanceCondition::from_node_condition)
        })
}

/// Determines which event describes the node when several events are scheduled at once.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// The last event in feed order wins.
    #[default]
    LastEvent,
    /// The most disruptive event wins. Ties go to the event which appears later in the feed.
    HighestSeverity,
}

/// Converts a (filtered) event document into the single condition published for the node.
pub fn normalize(
    document: &EventDocument,
    policy: MergePolicy,
    now: DateTime<Utc>,
) -> MaintenanceCondition {
    let selected = match policy {
        MergePolicy::LastEvent => document.events.last(),
        MergePolicy::HighestSeverity => document.events.iter().fold(None, |selected, candidate| {
            match selected {
                Some(current) if current_outranks(current, candidate) => Some(current),
                _ => Some(candidate),
            }
        }),
    };

    match selected {
        None => MaintenanceCondition::no_maintenance(now),
        Some(scheduled) => MaintenanceCondition {
            reason: event_reason(&scheduled.event_type),
            message: scheduled.description.clone(),
            transition_time: now,
        },
    }
}

/// The condition reason reported for a scheduled event.
///
/// A scheduled event always means maintenance is present, so an event whose type reads `None` is reported as an
/// unknown reason rather than as "no maintenance".
fn event_reason(event_type: &MaintenanceReason) -> MaintenanceReason {
    match event_type {
        MaintenanceReason::None => MaintenanceReason::Unknown(event_type.to_string()),
        reason => reason.clone(),
    }
}

fn current_outranks(current: &ScheduledEvent, candidate: &ScheduledEvent) -> bool {
    current.event_type.severity() > candidate.event_type.severity()
}
