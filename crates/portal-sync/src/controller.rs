//! Control runtime: one task owning the connection, the reconciler, the
//! dispatcher, the simulator and every timer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::commands::{CommandDispatcher, CommandTarget, DispatchOutcome};
use crate::config::Config;
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionSignal};
use crate::envelope::{EventEnvelope, InboundMessage, parse_inbound};
use crate::error::{ControlError, Result};
use crate::notify::NotificationSink;
use crate::reconciler::StateReconciler;
use crate::simulation::SimulationEngine;
use crate::state::ControlSnapshot;
use crate::transport::ControlTransport;

enum ControlRequest {
    Dispatch {
        command_id: String,
        target: CommandTarget,
        params: Map<String, Value>,
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
    Inject(EventEnvelope),
}

/// Handle to a running control runtime.
///
/// Dropping the handle aborts the runtime task; [`PortalController::stop`]
/// shuts it down gracefully.
pub struct PortalController {
    requests: mpsc::UnboundedSender<ControlRequest>,
    snapshots: watch::Receiver<ControlSnapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PortalController {
    /// Starts the runtime on the current tokio runtime.
    pub fn spawn(
        config: Config,
        transport: Arc<dyn ControlTransport>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let connection = ConnectionManager::new(
            transport,
            ConnectionConfig {
                backoff: config.backoff,
                max_reconnect_attempts: config.max_reconnect_attempts,
            },
            config.operator.clone(),
            Arc::clone(&sink),
            Arc::clone(&clock),
        );
        let reconciler = StateReconciler::new(config.reconciler.clone(), sink, Arc::clone(&clock));
        let simulation = SimulationEngine::new(config.simulation.clone(), clock);
        let dispatcher = CommandDispatcher::new(config.operator.name.clone())
            .with_ack_policy(config.command_ack_timeout, config.max_pending_commands);

        let initial = reconciler.snapshot(connection.snapshot(), false);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let runtime = ControlRuntime {
            config,
            connection,
            reconciler,
            dispatcher,
            simulation,
            simulating: false,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(runtime.run(request_rx, shutdown_rx));

        Self {
            requests: request_tx,
            snapshots: snapshot_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub async fn dispatch(
        &self,
        command_id: &str,
        target: CommandTarget,
        params: Map<String, Value>,
    ) -> Result<DispatchOutcome> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ControlRequest::Dispatch {
                command_id: command_id.to_string(),
                target,
                params,
                reply,
            })
            .map_err(|_| ControlError::Stopped)?;
        response.await.map_err(|_| ControlError::Stopped)?
    }

    /// Feeds an envelope through the reconciler as if it had arrived live.
    pub fn inject(&self, envelope: EventEnvelope) -> Result<()> {
        self.requests
            .send(ControlRequest::Inject(envelope))
            .map_err(|_| ControlError::Stopped)
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlSnapshot> {
        self.snapshots.clone()
    }

    /// Closes the channel, cancels every timer and waits for the runtime
    /// task to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|error| ControlError::Internal(format!("control runtime failed: {error}")))?;
        }
        Ok(())
    }
}

impl Drop for PortalController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ControlRuntime {
    config: Config,
    connection: ConnectionManager,
    reconciler: StateReconciler,
    dispatcher: CommandDispatcher,
    simulation: SimulationEngine,
    simulating: bool,
    snapshots: watch::Sender<ControlSnapshot>,
}

const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK_PERIOD);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ControlRuntime {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<ControlRequest>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut health = ticker(self.config.health_interval);
        let mut activity = ticker(self.config.simulation.activity_interval);
        let mut metrics = ticker(self.config.simulation.metrics_interval);

        if self.config.simulate_only {
            if let Some(signal) = self.connection.mark_unconfigured() {
                self.handle_signal(signal);
            }
        } else {
            self.connection.start();
        }
        self.publish();

        loop {
            let simulating_before = self.simulating;
            let ack_deadline = self.dispatcher.next_ack_deadline();
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                signal = self.connection.next_signal() => self.handle_signal(signal),
                _ = sleep_until_deadline(ack_deadline), if ack_deadline.is_some() => {
                    let settled = self
                        .dispatcher
                        .expire_overdue(Instant::now(), &mut self.reconciler);
                    debug!(settled, "unacknowledged commands settled locally");
                }
                _ = health.tick() => {
                    let report = self.reconciler.sweep_health();
                    debug!(
                        demoted = report.demoted.len(),
                        system_health = report.system_health.as_str(),
                        "health sweep"
                    );
                }
                _ = activity.tick(), if self.simulating => {
                    if let Some(envelope) = self.simulation.activity_tick() {
                        self.reconciler.apply(&envelope);
                    }
                }
                _ = metrics.tick(), if self.simulating => {
                    for envelope in self.simulation.metrics_tick() {
                        self.reconciler.apply(&envelope);
                    }
                }
            }
            if self.simulating && !simulating_before {
                activity.reset();
                metrics.reset();
            }
            self.publish();
        }

        self.connection.stop();
        self.publish();
        info!("control runtime stopped");
    }

    fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Dispatch {
                command_id,
                target,
                params,
                reply,
            } => {
                let outcome = self.dispatcher.dispatch(
                    &command_id,
                    target,
                    params,
                    &mut self.connection,
                    &mut self.reconciler,
                );
                if let Err(error) = &outcome {
                    warn!(command = %command_id, %error, "command rejected");
                }
                let _ = reply.send(outcome);
            }
            ControlRequest::Inject(envelope) => self.reconciler.apply(&envelope),
        }
    }

    fn handle_signal(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Opened => {
                debug!(pending = self.dispatcher.pending_count(), "control channel ready");
            }
            ConnectionSignal::Message(text) => self.handle_message(&text),
            ConnectionSignal::Reconnecting {
                attempt,
                delay,
                was_open,
            } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                if was_open {
                    self.dispatcher
                        .requeue_unacknowledged(&mut self.connection, &self.reconciler);
                }
            }
            ConnectionSignal::FailedPermanent { cause, reason } => {
                let settled = self.dispatcher.settle_pending_locally(&mut self.reconciler);
                info!(
                    cause = cause.as_str(),
                    %reason,
                    settled,
                    "switching to simulated portal traffic"
                );
                self.simulating = true;
            }
        }
    }

    fn handle_message(&mut self, text: &str) {
        match parse_inbound(text, self.reconciler.now()) {
            Ok(Some(InboundMessage::Event(envelope))) => self.reconciler.apply(&envelope),
            Ok(Some(InboundMessage::CommandAck(ack))) => {
                self.dispatcher.acknowledge(&ack, &mut self.reconciler);
            }
            Ok(Some(InboundMessage::Notification(notification))) => {
                self.reconciler.notify(notification);
            }
            Ok(Some(InboundMessage::Auth(result))) => {
                if result.accepted {
                    debug!("control channel accepted operator credentials");
                } else {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "operator credentials rejected".to_string());
                    if let Some(signal) = self.connection.reject_auth(reason) {
                        self.handle_signal(signal);
                    }
                }
            }
            Ok(None) => warn!("dropping control message with unknown type"),
            Err(error) => warn!(%error, "dropping malformed control message"),
        }
    }

    fn publish(&self) {
        let next = self
            .reconciler
            .snapshot(self.connection.snapshot(), self.simulating);
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
