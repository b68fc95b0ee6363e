//! Operator command vocabulary and dual-path dispatch.
//!
//! A command travels over the control channel when it is open and is
//! acknowledged by the server before its effect lands; otherwise its effect is
//! applied locally straight away. A command the server never acknowledges is
//! settled locally once its deadline passes. Both paths feed the same
//! envelopes through the reconciler, so the resulting state is identical.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{
    CommandAck, CommandAckStatus, EventEnvelope, EventOrigin, OutboundMessage, PortalEvent,
};
use crate::error::{ControlError, Result};
use crate::notify::{Notification, NotificationLevel};
use crate::reconciler::StateReconciler;
use crate::state::{PortalId, PortalStatus};

const OPERATOR_SOURCE: &str = "operator";

pub const DEFAULT_COMMAND_ACK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PENDING_COMMANDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Security,
    System,
    Communication,
}

impl CommandCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::System => "system",
            Self::Communication => "communication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ForceLogout,
    EnableMaintenance,
    DisableMaintenance,
    BroadcastMessage,
}

impl CommandKind {
    pub const ALL: [Self; 4] = [
        Self::ForceLogout,
        Self::EnableMaintenance,
        Self::DisableMaintenance,
        Self::BroadcastMessage,
    ];

    pub const fn id(self) -> &'static str {
        match self {
            Self::ForceLogout => "force_logout",
            Self::EnableMaintenance => "enable_maintenance",
            Self::DisableMaintenance => "disable_maintenance",
            Self::BroadcastMessage => "broadcast_message",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::ForceLogout => "Force Logout",
            Self::EnableMaintenance => "Enable Maintenance Mode",
            Self::DisableMaintenance => "Disable Maintenance Mode",
            Self::BroadcastMessage => "Broadcast Message",
        }
    }

    pub const fn category(self) -> CommandCategory {
        match self {
            Self::ForceLogout => CommandCategory::Security,
            Self::EnableMaintenance | Self::DisableMaintenance => CommandCategory::System,
            Self::BroadcastMessage => CommandCategory::Communication,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == raw)
    }
}

/// Portal selection for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    All,
    Portal(PortalId),
}

impl CommandTarget {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Portal(portal) => portal.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "all" {
            return Some(Self::All);
        }
        PortalId::parse(raw).map(Self::Portal)
    }

    pub fn portals(self) -> Vec<PortalId> {
        match self {
            Self::All => PortalId::ALL.to_vec(),
            Self::Portal(portal) => vec![portal],
        }
    }
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated command with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub id: Uuid,
    pub kind: CommandKind,
    pub target: CommandTarget,
    pub params: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(kind: CommandKind, target: CommandTarget, params: Map<String, Value>) -> Result<Self> {
        if kind == CommandKind::BroadcastMessage {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if message.is_empty() {
                return Err(ControlError::InvalidCommand(
                    "broadcast_message requires a non-empty params.message".to_string(),
                ));
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            target,
            params,
        })
    }

    fn broadcast_text(&self) -> String {
        self.params
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }
}

/// Which path carried a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Transport,
    Simulated,
}

impl ExecutionPath {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub request_id: Uuid,
    pub command: CommandKind,
    pub target: String,
    pub path: ExecutionPath,
    /// Activity log entry recording the attempt.
    pub log_entry: u64,
}

/// Where live commands go.
pub trait CommandLink {
    fn is_open(&self) -> bool;

    /// Transmit now. Returns false when nothing was sent.
    fn send(&mut self, message: &OutboundMessage) -> bool;

    /// Hold for the next successful open.
    fn enqueue(&mut self, message: OutboundMessage);
}

#[derive(Debug)]
struct PendingCommand {
    request: CommandRequest,
    ack_deadline: Instant,
}

/// Tracks commands sent over the link until the server acknowledges them.
///
/// A command that is not acknowledged before its deadline, or that is pushed
/// out of a full queue, is settled locally instead.
#[derive(Debug)]
pub struct CommandDispatcher {
    operator_name: String,
    ack_timeout: Duration,
    max_pending: usize,
    pending: VecDeque<PendingCommand>,
}

impl CommandDispatcher {
    pub fn new(operator_name: impl Into<String>) -> Self {
        Self {
            operator_name: operator_name.into(),
            ack_timeout: DEFAULT_COMMAND_ACK_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING_COMMANDS,
            pending: VecDeque::new(),
        }
    }

    pub fn with_ack_policy(mut self, ack_timeout: Duration, max_pending: usize) -> Self {
        self.ack_timeout = ack_timeout;
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest acknowledgement deadline among pending commands.
    pub fn next_ack_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|pending| pending.ack_deadline).min()
    }

    pub fn dispatch(
        &mut self,
        command_id: &str,
        target: CommandTarget,
        params: Map<String, Value>,
        link: &mut dyn CommandLink,
        reconciler: &mut StateReconciler,
    ) -> Result<DispatchOutcome> {
        let kind = CommandKind::parse(command_id)
            .ok_or_else(|| ControlError::InvalidCommand(format!("unknown command: {command_id}")))?;
        let request = CommandRequest::new(kind, target, params)?;

        let log_portal = match target {
            CommandTarget::All => PortalId::Manager,
            CommandTarget::Portal(portal) => portal,
        };
        let log_entry = reconciler.record_activity(
            log_portal,
            self.operator_name.clone(),
            format!("{} ({})", kind.label(), target),
        );

        let mut path = ExecutionPath::Simulated;
        if link.is_open() {
            let message = OutboundMessage::Command {
                request: request.clone(),
                timestamp: reconciler.now(),
            };
            if link.send(&message) {
                path = ExecutionPath::Transport;
            }
        }

        match path {
            ExecutionPath::Transport => {
                debug!(
                    command = kind.id(),
                    id = %request.id,
                    target = target.as_str(),
                    "command sent, awaiting acknowledgement"
                );
                if self.pending.len() >= self.max_pending {
                    if let Some(oldest) = self.pending.pop_front() {
                        warn!(
                            command = oldest.request.kind.id(),
                            id = %oldest.request.id,
                            max_pending = self.max_pending,
                            "pending command queue full, settling oldest locally"
                        );
                        settle_unacknowledged(&oldest.request, reconciler);
                    }
                }
                self.pending.push_back(PendingCommand {
                    request: request.clone(),
                    ack_deadline: Instant::now() + self.ack_timeout,
                });
            }
            ExecutionPath::Simulated => execute_locally(&request, reconciler),
        }

        Ok(DispatchOutcome {
            request_id: request.id,
            command: kind,
            target: target.as_str().to_string(),
            path,
            log_entry,
        })
    }

    /// Settles a pending command. Returns false for unknown ids.
    pub fn acknowledge(&mut self, ack: &CommandAck, reconciler: &mut StateReconciler) -> bool {
        let Some(position) = self
            .pending
            .iter()
            .position(|pending| pending.request.id == ack.id)
        else {
            debug!(id = %ack.id, "acknowledgement for unknown command");
            return false;
        };
        let Some(PendingCommand { request, .. }) = self.pending.remove(position) else {
            return false;
        };
        match ack.status {
            CommandAckStatus::Success => execute_locally(&request, reconciler),
            CommandAckStatus::Error => {
                let reason = ack
                    .message
                    .clone()
                    .unwrap_or_else(|| "rejected by control server".to_string());
                warn!(command = request.kind.id(), id = %request.id, %reason, "command failed");
                reconciler.notify(Notification::new(
                    NotificationLevel::Warning,
                    "Command failed",
                    format!("{} on {}: {}", request.kind.label(), request.target, reason),
                    request.kind.category().as_str(),
                ));
            }
        }
        true
    }

    /// Puts every unacknowledged command back on the link's buffer.
    pub fn requeue_unacknowledged(&self, link: &mut dyn CommandLink, reconciler: &StateReconciler) {
        for pending in &self.pending {
            link.enqueue(OutboundMessage::Command {
                request: pending.request.clone(),
                timestamp: reconciler.now(),
            });
        }
    }

    /// Runs every unacknowledged command locally, once.
    pub fn settle_pending_locally(&mut self, reconciler: &mut StateReconciler) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let settled = pending.len();
        for PendingCommand { request, .. } in pending {
            info!(command = request.kind.id(), id = %request.id, "settling command locally");
            execute_locally(&request, reconciler);
        }
        settled
    }

    /// Settles locally every command whose acknowledgement deadline is at or
    /// before `now`. Returns how many were settled.
    pub fn expire_overdue(&mut self, now: Instant, reconciler: &mut StateReconciler) -> usize {
        let (overdue, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.ack_deadline <= now);
        self.pending = waiting;
        let settled = overdue.len();
        for PendingCommand { request, .. } in overdue {
            warn!(
                command = request.kind.id(),
                id = %request.id,
                timeout_ms = self.ack_timeout.as_millis() as u64,
                "command not acknowledged in time, settling locally"
            );
            settle_unacknowledged(&request, reconciler);
        }
        settled
    }
}

fn settle_unacknowledged(request: &CommandRequest, reconciler: &mut StateReconciler) {
    reconciler.notify(Notification::new(
        NotificationLevel::Warning,
        "Command not acknowledged",
        format!(
            "{} on {} was not confirmed by the control server and was applied locally",
            request.kind.label(),
            request.target
        ),
        request.kind.category().as_str(),
    ));
    execute_locally(request, reconciler);
}

fn execute_locally(request: &CommandRequest, reconciler: &mut StateReconciler) {
    for envelope in local_effects(request, reconciler) {
        reconciler.apply(&envelope);
    }
    reconciler.notify(Notification::new(
        NotificationLevel::Info,
        "Command executed",
        format!("{} applied to {}", request.kind.label(), request.target),
        request.kind.category().as_str(),
    ));
}

/// The envelopes that realise a command against the current state.
pub fn local_effects(request: &CommandRequest, reconciler: &StateReconciler) -> Vec<EventEnvelope> {
    let now = reconciler.now();
    let envelope = |portal: PortalId, event: PortalEvent| {
        EventEnvelope::new(portal, event, now, OPERATOR_SOURCE).with_origin(EventOrigin::Operator)
    };

    match request.kind {
        CommandKind::ForceLogout => request
            .target
            .portals()
            .into_iter()
            .flat_map(|portal| {
                let active = reconciler.state().portal(portal).active_users;
                (0..active).map(move |_| (portal, PortalEvent::UserLogout { user: None }))
            })
            .map(|(portal, event)| envelope(portal, event))
            .collect(),
        CommandKind::EnableMaintenance | CommandKind::DisableMaintenance => {
            let status = if request.kind == CommandKind::EnableMaintenance {
                PortalStatus::Offline
            } else {
                PortalStatus::Idle
            };
            request
                .target
                .portals()
                .into_iter()
                .map(|portal| envelope(portal, PortalEvent::PortalStatusUpdate { status }))
                .collect()
        }
        CommandKind::BroadcastMessage => {
            let portal = match request.target {
                CommandTarget::All => PortalId::Manager,
                CommandTarget::Portal(portal) => portal,
            };
            vec![envelope(
                portal,
                PortalEvent::SystemAlert {
                    level: NotificationLevel::Info,
                    title: format!("Broadcast to {}", request.target),
                    message: request.broadcast_text(),
                    category: CommandCategory::Communication.as_str().to_string(),
                },
            )]
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::RecordingSink;
    use crate::reconciler::ReconcilerConfig;

    #[derive(Default)]
    struct FakeLink {
        open: bool,
        sent: Vec<OutboundMessage>,
        queued: Vec<OutboundMessage>,
    }

    impl CommandLink for FakeLink {
        fn is_open(&self) -> bool {
            self.open
        }

        fn send(&mut self, message: &OutboundMessage) -> bool {
            if self.open {
                self.sent.push(message.clone());
            }
            self.open
        }

        fn enqueue(&mut self, message: OutboundMessage) {
            self.queued.push(message);
        }
    }

    fn reconciler_with_logins(portal: PortalId, logins: usize) -> (StateReconciler, RecordingSink) {
        let sink = RecordingSink::new();
        let start = Utc.with_ymd_and_hms(2026, 4, 2, 11, 0, 0).single().expect("valid time");
        let mut reconciler = StateReconciler::new(
            ReconcilerConfig::default(),
            Arc::new(sink.clone()),
            Arc::new(ManualClock::new(start)),
        );
        for _ in 0..logins {
            reconciler.apply(&EventEnvelope::new(
                portal,
                PortalEvent::UserLogin { user: None },
                start,
                "test",
            ));
        }
        (reconciler, sink)
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn vocabulary_ids_labels_and_categories_are_stable() {
        let rows = CommandKind::ALL
            .into_iter()
            .map(|kind| (kind.id(), kind.label(), kind.category().as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            rows,
            vec![
                ("force_logout", "Force Logout", "security"),
                ("enable_maintenance", "Enable Maintenance Mode", "system"),
                ("disable_maintenance", "Disable Maintenance Mode", "system"),
                ("broadcast_message", "Broadcast Message", "communication"),
            ]
        );
        assert_eq!(CommandKind::parse("reboot"), None);
        assert_eq!(CommandTarget::parse("all"), Some(CommandTarget::All));
        assert_eq!(
            CommandTarget::parse("supplier"),
            Some(CommandTarget::Portal(PortalId::Supplier))
        );
        assert_eq!(CommandTarget::parse("everyone"), None);
    }

    #[test]
    fn invalid_commands_are_rejected_without_logging() {
        let (mut reconciler, _sink) = reconciler_with_logins(PortalId::Employee, 0);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink::default();

        let error = dispatcher
            .dispatch("reboot", CommandTarget::All, Map::new(), &mut link, &mut reconciler)
            .expect_err("unknown command");
        assert!(error.to_string().contains("unknown command: reboot"));

        let error = dispatcher
            .dispatch(
                "broadcast_message",
                CommandTarget::All,
                params(json!({"message": "  "})),
                &mut link,
                &mut reconciler,
            )
            .expect_err("empty broadcast");
        assert!(matches!(error, ControlError::InvalidCommand(_)));
        assert!(reconciler.state().activity().is_empty());
    }

    #[test]
    fn closed_link_executes_force_logout_immediately() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Employee, 3);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink::default();

        let outcome = dispatcher
            .dispatch(
                "force_logout",
                CommandTarget::Portal(PortalId::Employee),
                Map::new(),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");

        assert_eq!(outcome.path, ExecutionPath::Simulated);
        assert_eq!(reconciler.state().portal(PortalId::Employee).active_users, 0);
        assert_eq!(reconciler.state().metrics().total_active_users, 0);
        assert!(link.sent.is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(sink.count_level(NotificationLevel::Info), 1);

        let logged = reconciler
            .state()
            .activity()
            .iter()
            .next()
            .cloned()
            .expect("attempt logged");
        assert_eq!(logged.id, outcome.log_entry);
        assert_eq!(logged.action, "Force Logout (employee)");
    }

    #[test]
    fn open_link_defers_effect_until_acknowledged() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Employee, 2);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink {
            open: true,
            ..FakeLink::default()
        };

        let outcome = dispatcher
            .dispatch(
                "force_logout",
                CommandTarget::Portal(PortalId::Employee),
                Map::new(),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");
        assert_eq!(outcome.path, ExecutionPath::Transport);
        assert_eq!(reconciler.state().portal(PortalId::Employee).active_users, 2);
        assert_eq!(link.sent.len(), 1);
        assert_eq!(link.sent[0].to_wire()["id"], json!(outcome.request_id.to_string()));

        let ack = CommandAck {
            id: outcome.request_id,
            status: CommandAckStatus::Success,
            message: None,
        };
        assert!(dispatcher.acknowledge(&ack, &mut reconciler));
        assert!(!dispatcher.acknowledge(&ack, &mut reconciler));
        assert_eq!(reconciler.state().portal(PortalId::Employee).active_users, 0);
        assert_eq!(sink.count_level(NotificationLevel::Info), 1);
    }

    #[test]
    fn error_acknowledgement_warns_and_leaves_state() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Customer, 1);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink {
            open: true,
            ..FakeLink::default()
        };
        let outcome = dispatcher
            .dispatch(
                "enable_maintenance",
                CommandTarget::Portal(PortalId::Customer),
                Map::new(),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");

        dispatcher.acknowledge(
            &CommandAck {
                id: outcome.request_id,
                status: CommandAckStatus::Error,
                message: Some("maintenance window locked".to_string()),
            },
            &mut reconciler,
        );
        assert_eq!(
            reconciler.state().portal(PortalId::Customer).status,
            PortalStatus::Online
        );
        let warnings = sink
            .notifications()
            .into_iter()
            .filter(|note| note.level == NotificationLevel::Warning)
            .collect::<Vec<_>>();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("maintenance window locked"));
    }

    #[test]
    fn pending_commands_requeue_and_settle_exactly_once() {
        let (mut reconciler, _sink) = reconciler_with_logins(PortalId::Supplier, 1);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink {
            open: true,
            ..FakeLink::default()
        };
        dispatcher
            .dispatch(
                "enable_maintenance",
                CommandTarget::All,
                Map::new(),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");

        link.open = false;
        dispatcher.requeue_unacknowledged(&mut link, &reconciler);
        assert_eq!(link.queued.len(), 1);
        assert_eq!(link.queued[0].kind(), "command");

        assert_eq!(dispatcher.settle_pending_locally(&mut reconciler), 1);
        assert_eq!(dispatcher.settle_pending_locally(&mut reconciler), 0);
        for portal in PortalId::ALL {
            assert_eq!(reconciler.state().portal(portal).status, PortalStatus::Offline);
        }
    }

    #[test]
    fn broadcast_forwards_message_as_info_alert() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Manager, 0);
        let mut dispatcher = CommandDispatcher::new("Portal Console");
        let mut link = FakeLink::default();
        dispatcher
            .dispatch(
                "broadcast_message",
                CommandTarget::All,
                params(json!({"message": "Stock count at 18:00"})),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");

        let notes = sink.notifications();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].level, NotificationLevel::Info);
        assert_eq!(notes[0].message, "Stock count at 18:00");
        assert_eq!(notes[0].category, "communication");
        assert_eq!(notes[1].title, "Command executed");
    }

    #[test]
    fn overdue_commands_are_settled_locally_once() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Employee, 2);
        let mut dispatcher = CommandDispatcher::new("Portal Console")
            .with_ack_policy(Duration::from_secs(30), DEFAULT_MAX_PENDING_COMMANDS);
        let mut link = FakeLink {
            open: true,
            ..FakeLink::default()
        };
        let outcome = dispatcher
            .dispatch(
                "force_logout",
                CommandTarget::Portal(PortalId::Employee),
                Map::new(),
                &mut link,
                &mut reconciler,
            )
            .expect("dispatch");
        let deadline = dispatcher.next_ack_deadline().expect("deadline armed");

        assert_eq!(
            dispatcher.expire_overdue(deadline - Duration::from_millis(1), &mut reconciler),
            0
        );
        assert_eq!(reconciler.state().portal(PortalId::Employee).active_users, 2);

        assert_eq!(dispatcher.expire_overdue(deadline, &mut reconciler), 1);
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.next_ack_deadline(), None);
        assert_eq!(reconciler.state().portal(PortalId::Employee).active_users, 0);
        assert_eq!(sink.count_level(NotificationLevel::Warning), 1);
        assert_eq!(sink.count_level(NotificationLevel::Info), 1);

        // A late acknowledgement changes nothing.
        let late = CommandAck {
            id: outcome.request_id,
            status: CommandAckStatus::Success,
            message: None,
        };
        assert!(!dispatcher.acknowledge(&late, &mut reconciler));
        assert_eq!(sink.count_level(NotificationLevel::Info), 1);
    }

    #[test]
    fn full_pending_queue_settles_the_oldest_command() {
        let (mut reconciler, sink) = reconciler_with_logins(PortalId::Supplier, 0);
        let mut dispatcher = CommandDispatcher::new("Portal Console")
            .with_ack_policy(Duration::from_secs(30), 2);
        let mut link = FakeLink {
            open: true,
            ..FakeLink::default()
        };
        let mut ids = Vec::new();
        for command in ["enable_maintenance", "disable_maintenance", "enable_maintenance"] {
            let outcome = dispatcher
                .dispatch(
                    command,
                    CommandTarget::Portal(PortalId::Supplier),
                    Map::new(),
                    &mut link,
                    &mut reconciler,
                )
                .expect("dispatch");
            assert_eq!(outcome.path, ExecutionPath::Transport);
            ids.push(outcome.request_id);
        }

        assert_eq!(dispatcher.pending_count(), 2);
        assert_eq!(
            reconciler.state().portal(PortalId::Supplier).status,
            PortalStatus::Offline
        );
        assert_eq!(sink.count_level(NotificationLevel::Warning), 1);

        let first = CommandAck {
            id: ids[0],
            status: CommandAckStatus::Success,
            message: None,
        };
        assert!(!dispatcher.acknowledge(&first, &mut reconciler));
        let second = CommandAck { id: ids[1], ..first };
        assert!(dispatcher.acknowledge(&second, &mut reconciler));
        assert_eq!(
            reconciler.state().portal(PortalId::Supplier).status,
            PortalStatus::Idle
        );
    }
}
