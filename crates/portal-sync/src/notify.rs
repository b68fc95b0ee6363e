//! Operator notifications.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Urgent,
}

impl NotificationLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "success" => Some(Self::Success),
            "warning" => Some(Self::Warning),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Human-readable summary of a reconciled state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub category: String,
}

impl Notification {
    pub fn new(
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            category: category.into(),
        }
    }
}

/// Fire-and-forget receiver of notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes each notification as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Warning | NotificationLevel::Urgent => warn!(
                level = notification.level.as_str(),
                category = %notification.category,
                title = %notification.title,
                "{}",
                notification.message
            ),
            NotificationLevel::Info | NotificationLevel::Success => info!(
                level = notification.level.as_str(),
                category = %notification.category,
                title = %notification.title,
                "{}",
                notification.message
            ),
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    entries: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_level(&self, level: NotificationLevel) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|notification| notification.level == level)
            .count()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}
