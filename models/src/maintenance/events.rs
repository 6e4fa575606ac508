use super::MaintenanceReason;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use tracing::{event, Level};

/// The scheduled-events document served by the instance metadata service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventDocument {
    /// Version of the document. Two documents with the same incarnation describe the same set of events.
    #[serde(default)]
    pub document_incarnation: u64,
    #[serde(default)]
    pub events: Vec<ScheduledEvent>,
}

impl EventDocument {
    /// Retains only the events which affect `resource`.
    ///
    /// The incarnation is always carried over from the unfiltered document: a new incarnation with no remaining
    /// events signals that maintenance for this resource is over.
    pub fn for_resource(self, resource: &str) -> Self {
        EventDocument {
            document_incarnation: self.document_incarnation,
            events: self
                .events
                .into_iter()
                .filter(|scheduled| scheduled.resources.contains(resource))
                .collect(),
        }
    }

    /// The ids of all events in the document, in feed order.
    pub fn event_ids(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|scheduled| scheduled.event_id.clone())
            .collect()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub enum EventStatus {
    /// The event will start after the time given in `NotBefore`.
    Scheduled,
    /// The event has started.
    Started,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A single maintenance operation announced by the platform.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduledEvent {
    #[serde(rename = "EventId")]
    pub event_id: String,
    pub event_type: MaintenanceReason,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub event_status: EventStatus,
    /// The earliest time at which the platform starts the event unless it is acknowledged earlier.
    #[serde(default = "Utc::now", deserialize_with = "deserialize_not_before")]
    pub not_before: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub event_source: String,
}

/// Parses the RFC 1123 timestamp used by the platform, e.g. `Tue, 30 Mar 2021 13:39:24 GMT`.
///
/// The platform sends an empty string for events which may begin immediately, which maps to `now`.
pub fn parse_not_before(
    not_before: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, chrono::ParseError> {
    let not_before = not_before.trim();
    if not_before.is_empty() {
        return Ok(now);
    }
    DateTime::parse_from_rfc2822(not_before).map(|timestamp| timestamp.with_timezone(&Utc))
}

fn deserialize_not_before<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    let now = Utc::now();
    Ok(parse_not_before(&raw, now).unwrap_or_else(|err| {
        event!(
            Level::WARN,
            not_before = %raw,
            %err,
            "Could not parse NotBefore timestamp of scheduled event. Assuming the event may start now."
        );
        now
    }))
}
