//! Cross-thread relay into the dispatch context.
//!
//! Producer threads and tasks never touch the bus directly. They hold a
//! cloneable [`Relay`] and hand it `(topic, value)` pairs; the dispatch
//! context drains the queue with [`PubSub::process`](crate::pubsub::PubSub::process)
//! or [`PubSub::process_next`](crate::pubsub::PubSub::process_next) and
//! publishes on their behalf. The queue is a single unbounded tokio channel,
//! so messages from one producer are dispatched in the order it sent them.
//!
//! Two operations:
//!
//! - [`Relay::post`] enqueues and returns immediately.
//! - [`Relay::request`] enqueues and waits until the dispatch context has
//!   published the value, or until the deadline passes. A timed-out request
//!   is not retracted; it is still dispatched later.

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BusError, BusResult};

/// One queued publish.
#[derive(Debug)]
pub struct RelayMessage {
    pub(crate) topic: String,
    pub(crate) value: Value,
    pub(crate) completion: Option<oneshot::Sender<BusResult<()>>>,
}

/// Thread-safe handle for injecting publishes into a bus.
#[derive(Debug, Clone)]
pub struct Relay {
    tx: mpsc::UnboundedSender<RelayMessage>,
    default_timeout: Duration,
}

impl Relay {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RelayMessage>, default_timeout: Duration) -> Self {
        Self { tx, default_timeout }
    }

    /// Enqueue a publish without waiting.
    ///
    /// Fails only when the bus has been dropped.
    pub fn post(&self, topic: impl Into<String>, value: impl Into<Value>) -> BusResult<()> {
        self.tx
            .send(RelayMessage {
                topic: topic.into(),
                value: value.into(),
                completion: None,
            })
            .map_err(|_| BusError::RelayClosed)
    }

    /// Enqueue a publish and wait for it with the configured deadline.
    pub async fn request(&self, topic: impl Into<String>, value: impl Into<Value>) -> BusResult<()> {
        self.request_timeout(topic, value, self.default_timeout).await
    }

    /// Enqueue a publish and wait up to `timeout` for it to be dispatched.
    ///
    /// Returns the publish result, [`BusError::RelayTimeout`] when the
    /// deadline passes first, or [`BusError::RelayClosed`] when the bus is
    /// gone.
    pub async fn request_timeout(
        &self,
        topic: impl Into<String>,
        value: impl Into<Value>,
        timeout: Duration,
    ) -> BusResult<()> {
        let topic = topic.into();
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(RelayMessage {
                topic: topic.clone(),
                value: value.into(),
                completion: Some(done_tx),
            })
            .map_err(|_| BusError::RelayClosed)?;
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::RelayClosed),
            Err(_) => Err(BusError::RelayTimeout { topic, timeout }),
        }
    }

    /// Deadline used by [`Relay::request`].
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// True once the bus has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
