//! Message bus interface and the in-process implementation.
//!
//! The executor reports job progress on a bus: `local/<job_type>` when a job
//! starts, then [`MSG_TYPE_RESULT`] or [`MSG_TYPE_RUN_ERR`] when it finishes.
//! Emission never blocks a job; [`BusEmitter`] queues messages and a
//! background task forwards them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use capsule_common::BusError;

/// Subject of a successful job's output.
pub const MSG_TYPE_RESULT: &str = "capsule.result";

/// Subject of a failed job's error text.
pub const MSG_TYPE_RUN_ERR: &str = "capsule.runerr";

/// Subject announcing that a job started locally.
pub fn local_subject(job_type: &str) -> String {
    format!("local/{job_type}")
}

/// A bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Message type.
    pub subject: String,
    /// Id of the request or message this one answers.
    pub parent_id: Option<String>,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with a fresh id and no parent.
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            parent_id: None,
            payload: payload.into(),
        }
    }

    /// Set the parent id.
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A publish/subscribe message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a message to every subscriber.
    fn send(&self, message: Message) -> Result<(), BusError>;

    /// Receive every message sent after this call.
    fn subscribe(&self) -> broadcast::Receiver<Message>;

    /// Connect to a remote peer.
    async fn connect_endpoint(&self, endpoint: &str) -> Result<(), BusError>;
}

/// In-process bus backed by a broadcast channel.
///
/// Peers are checked for reachability and recorded; messages are not
/// forwarded to them.
#[derive(Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<Message>,
    peers: RwLock<Vec<String>>,
    closed: AtomicBool,
}

impl LocalBus {
    /// Default number of messages buffered per subscriber.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a bus buffering `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            peers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Endpoints connected so far.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    /// Reject further sends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn send(&self, message: Message) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        // No subscribers is not an error for a broadcast bus.
        if self.tx.send(message).is_err() {
            debug!("Bus message sent with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    async fn connect_endpoint(&self, endpoint: &str) -> Result<(), BusError> {
        let (host, port) = parse_endpoint(endpoint)?;

        TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| BusError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        info!(endpoint, "Connected to peer");
        self.peers.write().push(endpoint.to_string());
        Ok(())
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16), BusError> {
    let invalid = |reason: &str| BusError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;

    Ok((host.to_string(), port))
}

/// Fire-and-forget sender in front of a [`Bus`].
///
/// Messages go through a bounded queue drained by a background task, so
/// emitting never blocks. A full or closed queue drops the message with a
/// warning.
#[derive(Debug, Clone)]
pub struct BusEmitter {
    tx: mpsc::Sender<Message>,
}

impl BusEmitter {
    /// Default queue capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Start the forwarding task. Must be called from within a Tokio runtime.
    pub fn spawn(bus: Arc<dyn Bus>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let subject = message.subject.clone();
                if let Err(e) = bus.send(message) {
                    warn!(subject = %subject, error = %e, "Failed to forward bus message");
                }
            }
            debug!("Bus emitter stopped");
        });

        Self { tx }
    }

    /// Queue a message. Returns `false` if it was dropped.
    pub fn emit(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(subject = %message.subject, "Bus queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!(subject = %message.subject, "Bus queue closed, dropping message");
                false
            }
        }
    }
}

/// How static peers are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per peer.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Connect to each peer, retrying per `policy`.
///
/// Failures are logged and never propagated; a peer that exhausts its
/// attempts is not tried again. Returns how many peers connected.
pub async fn connect_static_peers(bus: &dyn Bus, peers: &[String], policy: RetryPolicy) -> usize {
    let mut connected = 0;

    for peer in peers {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match bus.connect_endpoint(peer).await {
                Ok(()) => {
                    connected += 1;
                    break;
                }
                Err(e) => {
                    error!(peer = %peer, attempt, error = %e, "Failed to connect to static peer");
                }
            }

            if attempt >= policy.attempts {
                error!(peer = %peer, "Static peer retries exceeded");
                break;
            }
            tokio::time::sleep(policy.delay).await;
        }
    }

    connected
}
