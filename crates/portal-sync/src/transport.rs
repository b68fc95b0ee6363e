//! Control channel transports.
//!
//! A transport opens a [`ControlChannel`]: an outbound text queue plus an
//! inbound queue of [`TransportEvent`]s. The WebSocket transport pumps those
//! queues from background reader/writer tasks; the in-memory transport hands
//! the far end of each channel to the caller so it can play the server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ControlError, Result};

/// Something observed on an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed(Option<String>),
}

/// Opens control channels.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn connect(&self) -> Result<ControlChannel>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> String;
}

/// One open control channel.
pub struct ControlChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    reader_task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader_task: None,
        }
    }

    /// Channel wired to a [`RemoteEnd`] in the same process.
    pub fn pair() -> (Self, RemoteEnd) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self::new(outbound_tx, inbound_rx),
            RemoteEnd {
                sent: outbound_rx,
                events: inbound_tx,
            },
        )
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| ControlError::NotConnected)
    }

    /// Next inbound event. A vanished peer reads as `Closed(None)`.
    pub async fn recv(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None))
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Server side of an in-process channel.
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RemoteEnd {
    /// Deliver a text frame to the client. Returns false once the client
    /// side is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    pub fn push_json(&self, value: &Value) -> bool {
        self.push(value.to_string())
    }

    pub fn close(&self, reason: Option<&str>) -> bool {
        self.events
            .send(TransportEvent::Closed(reason.map(str::to_string)))
            .is_ok()
    }

    /// Next frame the client sent, waiting for it.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Next frame the client sent, parsed as JSON, if one is queued.
    pub fn try_next_sent_json(&mut self) -> Option<Value> {
        let text = self.sent.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(text);
        }
        frames
    }
}

/// WebSocket control transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ControlError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }
        Ok(Self {
            url: parsed_url,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl ControlTransport for WebSocketTransport {
    async fn connect(&self) -> Result<ControlChannel> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                ControlError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(classify_handshake_error)?;

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let endpoint = self.url.to_string();

        let writer_events = inbound_tx.clone();
        let writer_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    warn!("websocket write error on {}: {}", writer_endpoint, error);
                    let _ = writer_events.send(TransportEvent::Closed(Some(error.to_string())));
                    return;
                }
            }
            // Channel handle dropped: say goodbye.
            let _ = writer.send(Message::Close(None)).await;
        });

        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx
                            .send(TransportEvent::Message(text.as_str().to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("received ping from {} ({} bytes)", endpoint, payload.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|frame| frame.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!("websocket read error on {}: {}", endpoint, error);
                        break Some(error.to_string());
                    }
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        let mut channel = ControlChannel::new(outbound_tx, inbound_rx);
        channel.reader_task = Some(reader_task);
        Ok(channel)
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

fn classify_handshake_error(error: tungstenite::Error) -> ControlError {
    if let tungstenite::Error::Http(response) = &error {
        let status = response.status().as_u16();
        if matches!(status, 401 | 403) {
            return ControlError::AuthRejected(format!("handshake rejected with HTTP {status}"));
        }
    }
    ControlError::WebSocket(error.to_string())
}

/// How the next [`MemoryTransport::connect`] call resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectScript {
    Accept,
    Refuse(String),
    RejectAuth(String),
}

/// In-process transport with scripted connect outcomes.
///
/// Accepted channels are handed out through the receiver returned by
/// [`MemoryTransport::new`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

struct MemoryTransportInner {
    script: Mutex<VecDeque<ConnectScript>>,
    fallback: Mutex<ConnectScript>,
    attempts: AtomicU32,
    accepted: mpsc::UnboundedSender<RemoteEnd>,
}

impl MemoryTransport {
    /// Transport that refuses every connection until scripted otherwise.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(MemoryTransportInner {
                    script: Mutex::new(VecDeque::new()),
                    fallback: Mutex::new(ConnectScript::Refuse("connection refused".to_string())),
                    attempts: AtomicU32::new(0),
                    accepted,
                }),
            },
            accepted_rx,
        )
    }

    /// Queue the outcome of the next unscripted connect.
    pub fn push_outcome(&self, outcome: ConnectScript) {
        self.inner
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Outcome used once the scripted queue is empty.
    pub fn set_fallback(&self, outcome: ConnectScript) {
        *self
            .inner
            .fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlTransport for MemoryTransport {
    async fn connect(&self) -> Result<ControlChannel> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .inner
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                self.inner
                    .fallback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });
        match outcome {
            ConnectScript::Accept => {
                let (channel, remote) = ControlChannel::pair();
                self.inner
                    .accepted
                    .send(remote)
                    .map_err(|_| ControlError::Connection("memory server gone".to_string()))?;
                Ok(channel)
            }
            ConnectScript::Refuse(reason) => Err(ControlError::Connection(reason)),
            ConnectScript::RejectAuth(reason) => Err(ControlError::AuthRejected(reason)),
        }
    }

    fn endpoint(&self) -> String {
        "memory://control".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_transport_rejects_non_ws_schemes() {
        let error = WebSocketTransport::new("http://localhost:3001", Duration::from_secs(1))
            .expect_err("http scheme should be rejected");
        assert!(error.to_string().contains("ws:// or wss://"));

        let transport =
            WebSocketTransport::new("wss://control.example.com/portal", Duration::from_secs(1))
                .expect("wss should be accepted");
        assert_eq!(transport.url(), "wss://control.example.com/portal");
    }

    #[tokio::test]
    async fn paired_channel_carries_frames_both_ways() {
        let (mut channel, mut remote) = ControlChannel::pair();
        channel
            .send_text("{\"type\":\"auth\"}".to_string())
            .expect("send should succeed");
        assert_eq!(
            remote.next_sent().await.as_deref(),
            Some("{\"type\":\"auth\"}")
        );

        assert!(remote.push("hello"));
        assert_eq!(
            channel.recv().await,
            TransportEvent::Message("hello".to_string())
        );

        drop(remote);
        assert_eq!(channel.recv().await, TransportEvent::Closed(None));
    }

    #[tokio::test]
    async fn memory_transport_follows_script_then_fallback() {
        let (transport, mut accepted) = MemoryTransport::new();
        transport.push_outcome(ConnectScript::Accept);
        transport.push_outcome(ConnectScript::RejectAuth("bad token".to_string()));

        assert!(transport.connect().await.is_ok());
        assert!(accepted.try_recv().is_ok());

        let rejected = transport.connect().await.err().expect("auth rejection");
        assert!(rejected.is_auth_rejection());

        let refused = transport.connect().await.err().expect("fallback refusal");
        assert!(!refused.is_auth_rejection());
        assert_eq!(transport.attempts(), 3);
    }
}
