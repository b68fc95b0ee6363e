//! Control channel wire format.
//!
//! Every message is a JSON object whose `type` field selects either a
//! control-plane message (`auth`, `command`, `notification`) or one of the
//! portal event tags. Event messages carry `portal`, `payload`, `timestamp`
//! and `from`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::commands::CommandRequest;
use crate::error::{ControlError, Result};
use crate::notify::{Notification, NotificationLevel};
use crate::state::{PortalId, PortalStatus};

/// Minor units (hundredths) per whole currency unit.
pub const MINOR_UNITS_PER_UNIT: u64 = 100;

/// Renders a minor-unit amount as a whole-unit decimal, e.g. `100000.40`.
pub fn format_amount(amount_minor: u64) -> String {
    let whole = amount_minor / MINOR_UNITS_PER_UNIT;
    match amount_minor % MINOR_UNITS_PER_UNIT {
        0 => whole.to_string(),
        cents => format!("{whole}.{cents:02}"),
    }
}

/// Diagnostic tag recording where an envelope came from. Not on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    #[default]
    Live,
    Simulated,
    Operator,
}

impl EventOrigin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Simulated => "simulated",
            Self::Operator => "operator",
        }
    }
}

/// Typed event payloads, one variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    PortalActivity {
        actor: String,
        action: String,
    },
    UserLogin {
        user: Option<String>,
    },
    UserLogout {
        user: Option<String>,
    },
    PortalStatusUpdate {
        status: PortalStatus,
    },
    /// The wire carries whole units; the event keeps minor units.
    TransactionAlert {
        amount_minor: u64,
    },
    SystemAlert {
        level: NotificationLevel,
        title: String,
        message: String,
        category: String,
    },
}

impl PortalEvent {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::PortalActivity { .. } => "portal_activity",
            Self::UserLogin { .. } => "user_login",
            Self::UserLogout { .. } => "user_logout",
            Self::PortalStatusUpdate { .. } => "portal_status_update",
            Self::TransactionAlert { .. } => "transaction_alert",
            Self::SystemAlert { .. } => "system_alert",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Self::PortalActivity { actor, action } => json!({"actor": actor, "action": action}),
            Self::UserLogin { user } | Self::UserLogout { user } => match user {
                Some(user) => json!({"user": user}),
                None => json!({}),
            },
            Self::PortalStatusUpdate { status } => json!({"status": status.as_str()}),
            Self::TransactionAlert { amount_minor } => {
                if amount_minor % MINOR_UNITS_PER_UNIT == 0 {
                    json!({"amount": amount_minor / MINOR_UNITS_PER_UNIT})
                } else {
                    json!({"amount": *amount_minor as f64 / MINOR_UNITS_PER_UNIT as f64})
                }
            }
            Self::SystemAlert {
                level,
                title,
                message,
                category,
            } => json!({
                "level": level.as_str(),
                "title": title,
                "message": message,
                "category": category,
            }),
        }
    }
}

/// The uniform message shape shared by the live channel, the simulator and
/// the command dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub portal: PortalId,
    pub event: PortalEvent,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub origin: EventOrigin,
}

impl EventEnvelope {
    pub fn new(
        portal: PortalId,
        event: PortalEvent,
        timestamp: DateTime<Utc>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            portal,
            event,
            timestamp,
            from: from.into(),
            origin: EventOrigin::Live,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.event.tag(),
            "portal": self.portal.as_str(),
            "payload": self.event.payload(),
            "timestamp": format_timestamp(self.timestamp),
            "from": self.from,
        })
    }
}

/// Operator presented to the control channel during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    pub id: String,
    pub name: String,
    pub role: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub id: Uuid,
    pub status: CommandAckStatus,
    pub message: Option<String>,
}

/// Message received from the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Auth(AuthResult),
    CommandAck(CommandAck),
    Notification(Notification),
    Event(EventEnvelope),
}

/// Message sent to the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Auth {
        operator: OperatorIdentity,
        timestamp: DateTime<Utc>,
    },
    Command {
        request: CommandRequest,
        timestamp: DateTime<Utc>,
    },
    Event(EventEnvelope),
}

impl OutboundMessage {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Command { .. } => "command",
            Self::Event(_) => "event",
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            Self::Auth {
                operator,
                timestamp,
            } => json!({
                "type": "auth",
                "operator": {
                    "id": operator.id,
                    "name": operator.name,
                    "role": operator.role,
                },
                "permissions": operator.permissions,
                "timestamp": format_timestamp(*timestamp),
            }),
            Self::Command { request, timestamp } => json!({
                "type": "command",
                "id": request.id.to_string(),
                "command": request.kind.id(),
                "target": request.target.as_str(),
                "params": request.params,
                "timestamp": format_timestamp(*timestamp),
            }),
            Self::Event(envelope) => envelope.to_wire(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse one wire message.
///
/// Returns `Ok(None)` for well-formed messages with an unknown `type`; the
/// caller logs and drops those.
pub fn parse_inbound(text: &str, received_at: DateTime<Utc>) -> Result<Option<InboundMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| ControlError::Protocol("expected JSON object message".to_string()))?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Protocol("missing message type".to_string()))?;

    match kind {
        "auth" => parse_auth(object).map(|result| Some(InboundMessage::Auth(result))),
        "command" => parse_command_ack(object).map(|ack| Some(InboundMessage::CommandAck(ack))),
        "notification" => {
            parse_notification(object).map(|note| Some(InboundMessage::Notification(note)))
        }
        tag => parse_event(tag, object, received_at)
            .map(|envelope| envelope.map(InboundMessage::Event)),
    }
}

fn parse_auth(object: &Map<String, Value>) -> Result<AuthResult> {
    let accepted = match object.get("accepted") {
        Some(Value::Bool(accepted)) => *accepted,
        Some(_) => {
            return Err(ControlError::Protocol(
                "invalid auth accepted flag".to_string(),
            ));
        }
        None => match object.get("status").and_then(Value::as_str) {
            Some("ok" | "accepted" | "success") => true,
            Some("rejected" | "denied" | "error") => false,
            _ => return Err(ControlError::Protocol("invalid auth response".to_string())),
        },
    };
    let reason = string_field(object, "reason").or_else(|| string_field(object, "message"));
    Ok(AuthResult { accepted, reason })
}

fn parse_command_ack(object: &Map<String, Value>) -> Result<CommandAck> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Protocol("missing command id".to_string()))?;
    let id = Uuid::parse_str(id)
        .map_err(|error| ControlError::Protocol(format!("invalid command id: {error}")))?;
    let status = match object.get("status").and_then(Value::as_str) {
        Some("success" | "ok") => CommandAckStatus::Success,
        Some("error" | "failed") => CommandAckStatus::Error,
        _ => {
            return Err(ControlError::Protocol(
                "invalid command status".to_string(),
            ));
        }
    };
    Ok(CommandAck {
        id,
        status,
        message: string_field(object, "message"),
    })
}

fn parse_notification(object: &Map<String, Value>) -> Result<Notification> {
    let message = string_field(object, "message")
        .ok_or_else(|| ControlError::Protocol("missing notification message".to_string()))?;
    let level = object
        .get("level")
        .and_then(Value::as_str)
        .and_then(NotificationLevel::parse)
        .unwrap_or(NotificationLevel::Info);
    Ok(Notification::new(
        level,
        string_field(object, "title").unwrap_or_else(|| "Notification".to_string()),
        message,
        string_field(object, "category").unwrap_or_else(|| "system".to_string()),
    ))
}

fn parse_event(
    tag: &str,
    object: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<Option<EventEnvelope>> {
    const EVENT_TAGS: [&str; 6] = [
        "portal_activity",
        "user_login",
        "user_logout",
        "portal_status_update",
        "transaction_alert",
        "system_alert",
    ];
    if !EVENT_TAGS.contains(&tag) {
        return Ok(None);
    }

    let portal = object
        .get("portal")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::Protocol(format!("missing portal on {tag}")))?;
    let portal = PortalId::parse(portal)
        .ok_or_else(|| ControlError::Protocol(format!("unknown portal: {portal}")))?;

    let empty = Map::new();
    let payload = match object.get("payload") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(payload)) => payload,
        Some(_) => {
            return Err(ControlError::Protocol(format!(
                "invalid payload on {tag}"
            )));
        }
    };

    let event = match tag {
        "portal_activity" => PortalEvent::PortalActivity {
            actor: string_field(payload, "actor").unwrap_or_else(|| "unknown".to_string()),
            action: string_field(payload, "action").unwrap_or_else(|| "unknown".to_string()),
        },
        "user_login" => PortalEvent::UserLogin {
            user: string_field(payload, "user"),
        },
        "user_logout" => PortalEvent::UserLogout {
            user: string_field(payload, "user"),
        },
        "portal_status_update" => {
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .and_then(PortalStatus::parse)
                .ok_or_else(|| {
                    ControlError::Protocol("invalid portal_status_update status".to_string())
                })?;
            PortalEvent::PortalStatusUpdate { status }
        }
        "transaction_alert" => PortalEvent::TransactionAlert {
            amount_minor: parse_amount_minor(payload.get("amount"))?,
        },
        _ => {
            let message = string_field(payload, "message").ok_or_else(|| {
                ControlError::Protocol("missing system_alert message".to_string())
            })?;
            PortalEvent::SystemAlert {
                level: payload
                    .get("level")
                    .and_then(Value::as_str)
                    .and_then(NotificationLevel::parse)
                    .unwrap_or(NotificationLevel::Warning),
                title: string_field(payload, "title").unwrap_or_else(|| "System alert".to_string()),
                message,
                category: string_field(payload, "category").unwrap_or_else(|| "system".to_string()),
            }
        }
    };

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or(received_at, |parsed| parsed.with_timezone(&Utc));
    let from = string_field(object, "from").unwrap_or_else(|| "remote".to_string());

    Ok(Some(EventEnvelope::new(portal, event, timestamp, from)))
}

fn parse_amount_minor(raw: Option<&Value>) -> Result<u64> {
    let raw = raw.ok_or_else(|| {
        ControlError::Protocol("missing transaction_alert amount".to_string())
    })?;
    let invalid = || ControlError::Protocol("invalid transaction_alert amount".to_string());
    if let Some(amount) = raw.as_u64() {
        return amount.checked_mul(MINOR_UNITS_PER_UNIT).ok_or_else(invalid);
    }
    match raw.as_f64() {
        Some(amount) if amount.is_finite() && amount >= 0.0 => {
            let minor = (amount * MINOR_UNITS_PER_UNIT as f64).round();
            if minor < u64::MAX as f64 {
                Ok(minor as u64)
            } else {
                Err(invalid())
            }
        }
        _ => Err(invalid()),
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
