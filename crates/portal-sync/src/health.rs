//! Idle detection and the system health rating.

use chrono::Duration as ChronoDuration;
use tracing::info;

use crate::notify::{Notification, NotificationLevel};
use crate::reconciler::StateReconciler;
use crate::state::{PortalId, PortalStatus, SystemHealth};

/// Step function over the number of online portals.
pub const fn classify_system_health(online_portals: usize) -> SystemHealth {
    match online_portals {
        0 | 1 => SystemHealth::Poor,
        2 => SystemHealth::Fair,
        3 => SystemHealth::Good,
        _ => SystemHealth::Excellent,
    }
}

/// Outcome of one health sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub demoted: Vec<PortalId>,
    pub system_health: SystemHealth,
}

impl StateReconciler {
    /// Demotes online portals that have been quiet for longer than the idle
    /// window, then recomputes the system health rating from scratch.
    pub fn sweep_health(&mut self) -> HealthReport {
        let now = self.now();
        let idle_after = ChronoDuration::from_std(self.config.idle_after)
            .unwrap_or_else(|_| ChronoDuration::MAX);

        let mut demoted = Vec::new();
        for (portal, state) in &mut self.state.portals {
            if state.status != PortalStatus::Online {
                continue;
            }
            // Portals that never reported activity are left alone.
            let Some(last_activity) = state.last_activity else {
                continue;
            };
            if now.signed_duration_since(last_activity) > idle_after {
                state.status = PortalStatus::Idle;
                demoted.push(*portal);
            }
        }

        for portal in &demoted {
            info!(portal = portal.as_str(), "portal demoted to idle");
            self.notify(Notification::new(
                NotificationLevel::Warning,
                "Portal idle",
                format!(
                    "{} portal has had no activity for over {} minutes",
                    portal,
                    self.config.idle_after.as_secs() / 60
                ),
                "system",
            ));
        }

        let system_health = classify_system_health(self.state.online_count());
        self.state.metrics.system_health = system_health;
        HealthReport {
            demoted,
            system_health,
        }
    }
}
