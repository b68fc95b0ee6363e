//! Single mutation entry point for portal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::connection::ConnectionSnapshot;
use crate::envelope::{
    EventEnvelope, EventOrigin, MINOR_UNITS_PER_UNIT, PortalEvent, format_amount,
};
use crate::notify::{Notification, NotificationLevel, NotificationSink};
use crate::state::{ControlSnapshot, ControlState, PortalId, PortalStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Transactions strictly above this many whole units are announced.
    pub large_transaction_threshold: u64,
    /// Online portals quiet for longer than this are demoted to idle.
    pub idle_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            large_transaction_threshold: 100_000,
            idle_after: Duration::from_secs(5 * 60),
        }
    }
}

/// Owns [`ControlState`] and applies envelopes to it in arrival order.
pub struct StateReconciler {
    pub(crate) state: ControlState,
    pub(crate) config: ReconcilerConfig,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl StateReconciler {
    pub fn new(
        config: ReconcilerConfig,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: ControlState::new(),
            config,
            sink,
            clock,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn notify(&self, notification: Notification) {
        self.sink.notify(notification);
    }

    pub fn apply(&mut self, envelope: &EventEnvelope) {
        let now = self.clock.now();
        debug!(
            portal = envelope.portal.as_str(),
            tag = envelope.event.tag(),
            origin = envelope.origin.as_str(),
            "applying portal event"
        );

        match &envelope.event {
            PortalEvent::UserLogin { .. } => {
                let portal = self.state.portal_mut(envelope.portal);
                portal.active_users = portal.active_users.saturating_add(1);
                portal.status = PortalStatus::Online;
                portal.touch(now);
            }
            PortalEvent::UserLogout { .. } => {
                // Status is left for the health sweep to correct.
                let portal = self.state.portal_mut(envelope.portal);
                portal.active_users = portal.active_users.saturating_sub(1);
            }
            PortalEvent::PortalStatusUpdate { status } => {
                let portal = self.state.portal_mut(envelope.portal);
                portal.status = *status;
                portal.touch(now);
            }
            PortalEvent::TransactionAlert { amount_minor } => {
                let metrics = &mut self.state.metrics;
                metrics.total_transactions = metrics.total_transactions.saturating_add(1);
                metrics.real_time_revenue = metrics.real_time_revenue.saturating_add(*amount_minor);
                let threshold_minor = self
                    .config
                    .large_transaction_threshold
                    .saturating_mul(MINOR_UNITS_PER_UNIT);
                if *amount_minor > threshold_minor {
                    self.sink.notify(Notification::new(
                        NotificationLevel::Success,
                        "Large transaction",
                        format!(
                            "{} portal processed a transaction of {} UGX",
                            envelope.portal,
                            format_amount(*amount_minor)
                        ),
                        "transactions",
                    ));
                }
            }
            PortalEvent::SystemAlert {
                level,
                title,
                message,
                category,
            } => {
                self.sink.notify(Notification::new(
                    *level,
                    title.clone(),
                    message.clone(),
                    category.clone(),
                ));
            }
            PortalEvent::PortalActivity { actor, action } => {
                self.state.activity.push(
                    envelope.portal,
                    actor.clone(),
                    action.clone(),
                    envelope.timestamp,
                    envelope.origin,
                );
                self.state.portal_mut(envelope.portal).touch(now);
            }
        }

        self.state.refresh_totals();
    }

    /// Appends an operator entry to the activity log. Returns the entry id.
    pub fn record_activity(
        &mut self,
        portal: PortalId,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> u64 {
        let now = self.clock.now();
        self.state
            .activity
            .push(portal, actor, action, now, EventOrigin::Operator)
    }

    pub fn snapshot(&self, connection: ConnectionSnapshot, simulated: bool) -> ControlSnapshot {
        ControlSnapshot {
            connection,
            simulated,
            portals: self.state.portals.clone(),
            metrics: self.state.metrics.clone(),
            activity: self.state.activity.iter().cloned().collect(),
        }
    }
}
