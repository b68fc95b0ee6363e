//! Control channel lifecycle: connect, authenticate, reconnect with backoff,
//! and give up for good.
//!
//! The manager owns the retry counter. Observers only see
//! [`ConnectionSnapshot`]s.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::commands::CommandLink;
use crate::envelope::{OperatorIdentity, OutboundMessage};
use crate::error::{ControlError, Result};
use crate::notify::{Notification, NotificationLevel, NotificationSink};
use crate::transport::{ControlChannel, ControlTransport, TransportEvent};

type PendingConnect = Pin<Box<dyn Future<Output = Result<ControlChannel>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Closed,
    FailedPermanent,
}

impl ConnectionPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::FailedPermanent => "failed_permanent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub phase: ConnectionPhase,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub next_retry_ms: Option<u64>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Closed,
            attempt: 0,
            last_error: None,
            next_retry_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionConfig {
    pub backoff: BackoffPolicy,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: 15,
        }
    }
}

/// Why the manager stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Exhausted,
    AuthRejected,
    Unconfigured,
}

impl FailureCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::AuthRejected => "auth_rejected",
            Self::Unconfigured => "unconfigured",
        }
    }
}

/// Lifecycle event surfaced to the runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Opened,
    Message(String),
    Reconnecting {
        attempt: u32,
        delay: Duration,
        was_open: bool,
    },
    FailedPermanent {
        cause: FailureCause,
        reason: String,
    },
}

pub struct ConnectionManager {
    transport: Arc<dyn ControlTransport>,
    config: ConnectionConfig,
    operator: OperatorIdentity,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    phase: ConnectionPhase,
    attempt: u32,
    last_error: Option<String>,
    channel: Option<ControlChannel>,
    pending_connect: Option<PendingConnect>,
    retry_at: Option<Instant>,
    outbound_queue: VecDeque<OutboundMessage>,
    stopped: bool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ControlTransport>,
        config: ConnectionConfig,
        operator: OperatorIdentity,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            config,
            operator,
            sink,
            clock,
            phase: ConnectionPhase::Closed,
            attempt: 0,
            last_error: None,
            channel: None,
            pending_connect: None,
            retry_at: None,
            outbound_queue: VecDeque::new(),
            stopped: false,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_failed_permanent(&self) -> bool {
        self.phase == ConnectionPhase::FailedPermanent
    }

    pub fn queued_len(&self) -> usize {
        self.outbound_queue.len()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let now = Instant::now();
        ConnectionSnapshot {
            phase: self.phase,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            next_retry_ms: self
                .retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// Begins an asynchronous open. Completion is reported by
    /// [`ConnectionManager::next_signal`].
    pub fn start(&mut self) {
        if self.stopped
            || self.phase == ConnectionPhase::FailedPermanent
            || self.pending_connect.is_some()
            || self.channel.is_some()
        {
            return;
        }
        info!(
            endpoint = %self.transport.endpoint(),
            attempt = self.attempt,
            "connecting to control channel"
        );
        self.phase = ConnectionPhase::Connecting;
        self.retry_at = None;
        let transport = Arc::clone(&self.transport);
        self.pending_connect = Some(Box::pin(async move { transport.connect().await }));
    }

    /// Drives the in-flight open, the live channel and the retry deadline.
    ///
    /// Cancel safe: dropping the future keeps the in-flight open and the
    /// deadline for the next call. Pends forever once there is nothing left
    /// to drive.
    pub async fn next_signal(&mut self) -> ConnectionSignal {
        loop {
            if let Some(connecting) = self.pending_connect.as_mut() {
                let result = connecting.await;
                self.pending_connect = None;
                match result {
                    Ok(channel) => match self.on_open(channel) {
                        Ok(()) => return ConnectionSignal::Opened,
                        Err(error) => return self.on_loss(error, false),
                    },
                    Err(error) => return self.on_loss(error, false),
                }
            }

            if let Some(channel) = self.channel.as_mut() {
                let event = channel.recv().await;
                match event {
                    TransportEvent::Message(text) => return ConnectionSignal::Message(text),
                    TransportEvent::Closed(reason) => {
                        self.channel = None;
                        let error = ControlError::Connection(
                            reason.unwrap_or_else(|| "connection closed".to_string()),
                        );
                        return self.on_loss(error, true);
                    }
                }
            }

            if let Some(deadline) = self.retry_at {
                tokio::time::sleep_until(deadline).await;
                self.retry_at = None;
                self.start();
                continue;
            }

            return std::future::pending().await;
        }
    }

    fn on_open(&mut self, channel: ControlChannel) -> Result<()> {
        let auth = OutboundMessage::Auth {
            operator: self.operator.clone(),
            timestamp: self.clock.now(),
        };
        channel.send_text(auth.to_text()?)?;

        self.channel = Some(channel);
        self.phase = ConnectionPhase::Open;
        self.attempt = 0;
        self.last_error = None;
        info!(endpoint = %self.transport.endpoint(), "control channel open");
        self.sink.notify(Notification::new(
            NotificationLevel::Success,
            "Control channel connected",
            "Live portal control is available",
            "system",
        ));

        while let Some(message) = self.outbound_queue.pop_front() {
            if !self.send(&message) {
                self.outbound_queue.push_front(message);
                break;
            }
        }
        Ok(())
    }

    fn on_loss(&mut self, error: ControlError, was_open: bool) -> ConnectionSignal {
        self.channel = None;
        let reason = error.to_string();
        if error.is_auth_rejection() {
            return self.fail_permanent(FailureCause::AuthRejected, reason);
        }

        self.phase = ConnectionPhase::Closed;
        self.last_error = Some(reason.clone());
        if self.attempt >= self.config.max_reconnect_attempts {
            return self.fail_permanent(FailureCause::Exhausted, reason);
        }

        let delay = self.config.backoff.compute_delay(self.attempt);
        self.attempt += 1;
        self.retry_at = Some(Instant::now() + delay);
        warn!(
            error = %reason,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "control channel lost, scheduling reconnect"
        );
        ConnectionSignal::Reconnecting {
            attempt: self.attempt,
            delay,
            was_open,
        }
    }

    /// Treats an inbound authentication refusal as permanent.
    /// Returns `None` if the manager had already given up.
    pub fn reject_auth(&mut self, reason: impl Into<String>) -> Option<ConnectionSignal> {
        if self.is_failed_permanent() {
            return None;
        }
        Some(self.fail_permanent(FailureCause::AuthRejected, reason.into()))
    }

    /// Marks the manager as having no live channel at all.
    pub fn mark_unconfigured(&mut self) -> Option<ConnectionSignal> {
        if self.is_failed_permanent() {
            return None;
        }
        Some(self.fail_permanent(
            FailureCause::Unconfigured,
            "no live channel configured".to_string(),
        ))
    }

    fn fail_permanent(&mut self, cause: FailureCause, reason: String) -> ConnectionSignal {
        self.channel = None;
        self.pending_connect = None;
        self.retry_at = None;
        self.phase = ConnectionPhase::FailedPermanent;
        self.last_error = Some(reason.clone());
        let dropped = self.outbound_queue.len();
        self.outbound_queue.clear();
        warn!(cause = cause.as_str(), %reason, dropped, "control channel permanently unavailable");

        let notification = match cause {
            FailureCause::Exhausted => Notification::new(
                NotificationLevel::Urgent,
                "Control channel unavailable",
                format!(
                    "Gave up after {} reconnect attempts; showing simulated data",
                    self.attempt
                ),
                "system",
            ),
            FailureCause::AuthRejected => Notification::new(
                NotificationLevel::Urgent,
                "Control channel rejected credentials",
                format!("{reason}; showing simulated data"),
                "security",
            ),
            FailureCause::Unconfigured => Notification::new(
                NotificationLevel::Info,
                "Simulation mode",
                "No live control channel configured; showing simulated data",
                "system",
            ),
        };
        self.sink.notify(notification);
        ConnectionSignal::FailedPermanent { cause, reason }
    }

    /// Transmits when open. Returns false when nothing was sent.
    pub fn send(&mut self, message: &OutboundMessage) -> bool {
        if self.phase != ConnectionPhase::Open {
            return false;
        }
        let Some(channel) = self.channel.as_ref() else {
            return false;
        };
        let text = match message.to_text() {
            Ok(text) => text,
            Err(error) => {
                warn!(kind = message.kind(), %error, "failed to encode outbound message");
                return false;
            }
        };
        match channel.send_text(text) {
            Ok(()) => {
                debug!(kind = message.kind(), "sent control message");
                true
            }
            Err(error) => {
                warn!(kind = message.kind(), %error, "failed to send control message");
                false
            }
        }
    }

    /// Buffers a message for the next successful open.
    pub fn enqueue(&mut self, message: OutboundMessage) {
        if self.is_failed_permanent() || self.stopped {
            debug!(kind = message.kind(), "dropping message, channel will not reopen");
            return;
        }
        self.outbound_queue.push_back(message);
    }

    /// Closes the channel and cancels the in-flight open and retry deadline.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.channel = None;
        self.pending_connect = None;
        self.retry_at = None;
        self.outbound_queue.clear();
        if self.phase != ConnectionPhase::FailedPermanent {
            self.phase = ConnectionPhase::Closed;
        }
        info!("control channel stopped");
    }
}

impl CommandLink for ConnectionManager {
    fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }

    fn send(&mut self, message: &OutboundMessage) -> bool {
        ConnectionManager::send(self, message)
    }

    fn enqueue(&mut self, message: OutboundMessage) {
        ConnectionManager::enqueue(self, message);
    }
}
