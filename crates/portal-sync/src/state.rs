//! Portal presence and metrics state.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSnapshot;
use crate::envelope::EventOrigin;

/// Maximum number of retained activity log entries.
pub const ACTIVITY_LOG_CAPACITY: usize = 50;

/// Sub-application whose live presence is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalId {
    Manager,
    Employee,
    Customer,
    Supplier,
}

impl PortalId {
    pub const ALL: [Self; 4] = [Self::Manager, Self::Employee, Self::Customer, Self::Supplier];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Employee => "employee",
            Self::Customer => "customer",
            Self::Supplier => "supplier",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manager" => Some(Self::Manager),
            "employee" => Some(Self::Employee),
            "customer" => Some(Self::Customer),
            "supplier" => Some(Self::Supplier),
            _ => None,
        }
    }
}

impl fmt::Display for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalStatus {
    Online,
    Idle,
    Offline,
}

impl PortalStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Self::Online),
            "idle" => Some(Self::Idle),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalState {
    pub active_users: u32,
    pub status: PortalStatus,
    pub last_activity: Option<DateTime<Utc>>,
}

impl PortalState {
    /// Moves `last_activity` forward; older timestamps are ignored.
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity = Some(match self.last_activity {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }
}

impl Default for PortalState {
    fn default() -> Self {
        Self {
            active_users: 0,
            status: PortalStatus::Offline,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SystemHealth {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlledMetrics {
    pub total_active_users: u64,
    pub total_transactions: u64,
    /// Minor units (hundredths).
    pub real_time_revenue: u64,
    pub system_health: SystemHealth,
}

impl Default for ControlledMetrics {
    fn default() -> Self {
        Self {
            total_active_users: 0,
            total_transactions: 0,
            real_time_revenue: 0,
            system_health: SystemHealth::Poor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: u64,
    pub portal: PortalId,
    pub actor: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub origin: EventOrigin,
}

/// Most-recent-first log with a fixed capacity.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityLogEntry>,
    capacity: usize,
    next_id: u64,
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    pub fn push(
        &mut self,
        portal: PortalId,
        actor: impl Into<String>,
        action: impl Into<String>,
        timestamp: DateTime<Utc>,
        origin: EventOrigin,
    ) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        self.entries.push_front(ActivityLogEntry {
            id,
            portal,
            actor: actor.into(),
            action: action.into(),
            timestamp,
            origin,
        });
        self.entries.truncate(self.capacity);
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityLogEntry> {
        self.entries.iter()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_LOG_CAPACITY)
    }
}

/// Owned state container. Only the reconciler mutates it.
#[derive(Debug, Clone)]
pub struct ControlState {
    pub(crate) portals: BTreeMap<PortalId, PortalState>,
    pub(crate) metrics: ControlledMetrics,
    pub(crate) activity: ActivityLog,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            portals: PortalId::ALL
                .into_iter()
                .map(|portal| (portal, PortalState::default()))
                .collect(),
            metrics: ControlledMetrics::default(),
            activity: ActivityLog::default(),
        }
    }

    pub fn portal(&self, portal: PortalId) -> &PortalState {
        // Every id is seeded in `new`.
        static OFFLINE: PortalState = PortalState {
            active_users: 0,
            status: PortalStatus::Offline,
            last_activity: None,
        };
        self.portals.get(&portal).unwrap_or(&OFFLINE)
    }

    pub(crate) fn portal_mut(&mut self, portal: PortalId) -> &mut PortalState {
        self.portals.entry(portal).or_default()
    }

    pub fn metrics(&self) -> &ControlledMetrics {
        &self.metrics
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn summed_active_users(&self) -> u64 {
        self.portals
            .values()
            .map(|state| u64::from(state.active_users))
            .sum()
    }

    pub fn online_count(&self) -> usize {
        self.portals
            .values()
            .filter(|state| state.status == PortalStatus::Online)
            .count()
    }

    pub(crate) fn refresh_totals(&mut self) {
        self.metrics.total_active_users = self.summed_active_users();
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlSnapshot {
    pub connection: ConnectionSnapshot,
    pub simulated: bool,
    pub portals: BTreeMap<PortalId, PortalState>,
    pub metrics: ControlledMetrics,
    pub activity: Vec<ActivityLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_log_keeps_most_recent_first_and_caps() {
        let mut log = ActivityLog::with_capacity(3);
        let now = Utc::now();
        for index in 0..5 {
            log.push(
                PortalId::Employee,
                format!("actor-{index}"),
                "scan",
                now,
                EventOrigin::Live,
            );
        }
        let actors = log.iter().map(|entry| entry.actor.as_str()).collect::<Vec<_>>();
        assert_eq!(actors, vec!["actor-4", "actor-3", "actor-2"]);
        assert_eq!(log.iter().next().map(|entry| entry.id), Some(5));
    }

    #[test]
    fn touch_never_moves_last_activity_backwards() {
        let mut state = PortalState::default();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(10);
        state.touch(later);
        state.touch(earlier);
        assert_eq!(state.last_activity, Some(later));
    }

    #[test]
    fn portal_ids_parse_only_the_closed_set() {
        for portal in PortalId::ALL {
            assert_eq!(PortalId::parse(portal.as_str()), Some(portal));
        }
        assert_eq!(PortalId::parse("admin"), None);
        assert_eq!(PortalId::parse("Employee"), None);
    }
}
