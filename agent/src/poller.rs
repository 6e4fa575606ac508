//! The maintenance poller turns the scheduled-events feed into the node's maintenance condition.
//!
//! Each tick reads the feed for this node and plans exactly one step from the previous [`PollerState`]: publish a
//! new condition when the document incarnation changed, acknowledge the current events once the grace period has
//! elapsed, or refresh the condition's heartbeat. Planning is a pure function so the state machine can be tested
//! without a timer.
use crate::exporter::ConditionExporter;
use crate::metadata::{metadata_error, MetadataClient};
use models::maintenance::{normalize, EventDocument, MaintenanceCondition, MergePolicy, ScheduledEvent};

use chrono::{DateTime, Utc};
use snafu::ResultExt;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, poller_error::Error>;

/// Where the poller is in the publish/acknowledge cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollerPhase {
    /// No maintenance is outstanding.
    Idle,
    /// Maintenance was published but not yet acknowledged.
    Pending,
    /// Maintenance was published and acknowledged to the platform.
    Acknowledged,
}

/// State carried from one tick to the next. It is never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PollerState {
    /// `None` until the first document has been published.
    pub last_incarnation: Option<u64>,
    pub last_transition_time: DateTime<Utc>,
    pub last_export_time: DateTime<Utc>,
    pub acknowledged: bool,
    /// The condition most recently exported.
    pub condition: Option<MaintenanceCondition>,
}

impl PollerState {
    pub fn phase(&self) -> PollerPhase {
        match &self.condition {
            Some(condition) if condition.present() && self.acknowledged => {
                PollerPhase::Acknowledged
            }
            Some(condition) if condition.present() => PollerPhase::Pending,
            _ => PollerPhase::Idle,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub ack_grace_period: Duration,
    pub heartbeat_period: Duration,
    pub merge_policy: MergePolicy,
}

impl Default for PollerSettings {
    fn default() -> Self {
        PollerSettings {
            poll_interval: Duration::from_secs(30),
            ack_grace_period: Duration::from_secs(60),
            heartbeat_period: Duration::from_secs(300),
            merge_policy: MergePolicy::default(),
        }
    }
}

/// The single step a tick performs.
#[derive(Clone, Debug, PartialEq)]
pub enum TickPlan {
    /// The incarnation changed: export `condition` and report every event.
    Publish {
        condition: MaintenanceCondition,
        events: Vec<ScheduledEvent>,
    },
    /// The grace period has passed for unacknowledged events.
    Acknowledge { event_ids: Vec<String> },
    /// Re-export the current condition so its heartbeat stays fresh.
    Heartbeat { condition: MaintenanceCondition },
    Wait,
}

/// What a tick ended up doing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Published,
    Acknowledged,
    HeartbeatSent,
    Waited,
    ExportFailed,
    AcknowledgeFailed,
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, period: Duration) -> bool {
    // A clock that moved backwards yields a negative duration, which never satisfies the period.
    (now - since)
        .to_std()
        .map(|elapsed| elapsed >= period)
        .unwrap_or(false)
}

/// Decides what a tick should do given the previous state and the freshly fetched (filtered) document.
///
/// Acknowledgement takes precedence over the heartbeat; a tick whose acknowledgement fails still sends a due
/// heartbeat. A new incarnation always restarts the grace period, so an acknowledgement trails the corresponding
/// publish by at least one grace period.
pub fn plan_tick(
    state: &PollerState,
    document: &EventDocument,
    now: DateTime<Utc>,
    settings: &PollerSettings,
) -> TickPlan {
    if state.last_incarnation != Some(document.document_incarnation) {
        return TickPlan::Publish {
            condition: normalize(document, settings.merge_policy, now),
            events: document.events.clone(),
        };
    }

    if !document.events.is_empty()
        && !state.acknowledged
        && elapsed_at_least(state.last_transition_time, now, settings.ack_grace_period)
    {
        return TickPlan::Acknowledge {
            event_ids: document.event_ids(),
        };
    }

    match heartbeat_due(state, now, settings) {
        Some(condition) => TickPlan::Heartbeat {
            condition: condition.clone(),
        },
        None => TickPlan::Wait,
    }
}

/// Returns the exported condition if its heartbeat is due.
fn heartbeat_due<'a>(
    state: &'a PollerState,
    now: DateTime<Utc>,
    settings: &PollerSettings,
) -> Option<&'a MaintenanceCondition> {
    state
        .condition
        .as_ref()
        .filter(|_| elapsed_at_least(state.last_export_time, now, settings.heartbeat_period))
}

/// Runs the tick loop for one node.
pub struct MaintenancePoller<M: MetadataClient, E: ConditionExporter> {
    metadata_client: M,
    exporter: E,
    settings: PollerSettings,
    state: PollerState,
}

impl<M: MetadataClient, E: ConditionExporter> MaintenancePoller<M, E> {
    pub fn new(metadata_client: M, exporter: E, settings: PollerSettings) -> Self {
        MaintenancePoller {
            metadata_client,
            exporter,
            settings,
            state: PollerState::default(),
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// Performs one tick. Only a failure to read the feed is returned as an error.
    #[instrument(skip(self), err)]
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let document = self
            .metadata_client
            .fetch_self_events()
            .await
            .context(poller_error::FetchEventsSnafu)?;

        let outcome = match plan_tick(&self.state, &document, now, &self.settings) {
            TickPlan::Publish { condition, events } => {
                self.publish(condition, &events, document.document_incarnation, now)
                    .await
            }
            TickPlan::Acknowledge { event_ids } => {
                let outcome = self.acknowledge(&event_ids).await;
                if outcome == TickOutcome::AcknowledgeFailed {
                    // Repeated acknowledgement failures must not let the condition's heartbeat go stale.
                    if let Some(condition) = heartbeat_due(&self.state, now, &self.settings).cloned() {
                        self.heartbeat(&condition, now).await;
                    }
                }
                outcome
            }
            TickPlan::Heartbeat { condition } => self.heartbeat(&condition, now).await,
            TickPlan::Wait => TickOutcome::Waited,
        };

        event!(Level::DEBUG, ?outcome, phase = ?self.state.phase(), "Tick complete.");
        Ok(outcome)
    }

    async fn publish(
        &mut self,
        condition: MaintenanceCondition,
        events: &[ScheduledEvent],
        incarnation: u64,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        if let Err(err) = self.exporter.export_condition(&condition, now).await {
            // The state is left alone so the next tick sees the incarnation change again.
            event!(Level::WARN, %err, incarnation, "Failed to export maintenance condition.");
            return TickOutcome::ExportFailed;
        }
        if let Err(err) = self.exporter.export_problems(events, now).await {
            event!(Level::WARN, %err, incarnation, "Failed to record scheduled events.");
        }

        event!(
            Level::INFO,
            incarnation,
            reason = %condition.reason,
            events = events.len(),
            "Published new maintenance state."
        );
        self.state = PollerState {
            last_incarnation: Some(incarnation),
            last_transition_time: now,
            last_export_time: now,
            acknowledged: false,
            condition: Some(condition),
        };
        TickOutcome::Published
    }

    async fn heartbeat(&mut self, condition: &MaintenanceCondition, now: DateTime<Utc>) -> TickOutcome {
        match self.exporter.export_condition(condition, now).await {
            Ok(()) => {
                self.state.last_export_time = now;
                TickOutcome::HeartbeatSent
            }
            Err(err) => {
                event!(Level::WARN, %err, "Failed to refresh maintenance condition.");
                TickOutcome::ExportFailed
            }
        }
    }

    async fn acknowledge(&mut self, event_ids: &[String]) -> TickOutcome {
        match self.metadata_client.acknowledge(event_ids).await {
            Ok(()) => {
                event!(Level::INFO, ?event_ids, "Acknowledged scheduled events.");
                self.state.acknowledged = true;
                TickOutcome::Acknowledged
            }
            Err(err) => {
                event!(Level::WARN, %err, "Failed to acknowledge scheduled events. Retrying next tick.");
                TickOutcome::AcknowledgeFailed
            }
        }
    }

    /// Ticks until `shutdown` is cancelled or the feed can no longer be read.
    ///
    /// The first tick happens immediately. A slow tick delays the next one rather than overlapping it.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    event!(Level::INFO, "Shutdown requested, stopping maintenance poller.");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    event!(Level::INFO, "Shutdown requested, abandoning in-flight tick.");
                    return Ok(());
                }
                result = self.tick(Utc::now()) => {
                    result?;
                }
            }
        }
    }
}

pub mod poller_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to determine scheduled maintenance: '{}'", source))]
        FetchEvents { source: metadata_error::Error },
    }
}
