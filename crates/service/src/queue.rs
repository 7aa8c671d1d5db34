//! In-process job queue — named queues with parallel consumers and
//! exponential-backoff redelivery.
//!
//! Stands in for the external queue runtime the engine is written against:
//! publishers never wait for consumers, consumers may run with parallelism
//! greater than one, and a handler error redelivers the message until the
//! attempt cap is reached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Delivery attempts per message before it is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

/// A queued message with its delivery attempt counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueMessage {
    pub attempt: u32,
    pub payload: serde_json::Value,
}

struct QueueSlot {
    tx: UnboundedSender<QueueMessage>,
    rx: Option<UnboundedReceiver<QueueMessage>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// Named in-process queues. Messages published before any consumer starts
/// are buffered in the channel; each queue has exactly one receiving end.
#[derive(Default)]
pub struct QueueHub {
    queues: Mutex<HashMap<String, QueueSlot>>,
}

impl QueueHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload onto the named queue as a first delivery.
    pub fn publish(&self, queue: &str, payload: serde_json::Value) {
        self.publish_message(queue, QueueMessage { attempt: 0, payload });
    }

    fn publish_message(&self, queue: &str, msg: QueueMessage) {
        let mut queues = self.queues.lock();
        let slot = queues
            .entry(queue.to_owned())
            .or_insert_with(QueueSlot::new);
        // An unbounded send only fails once the receiver is dropped.
        if slot.tx.send(msg).is_err() {
            tracing::warn!(queue, "queue receiver is gone, message dropped");
        }
    }

    /// Take the receiving end of a queue, creating the queue if needed.
    /// Returns `None` if the receiver was already taken.
    pub fn take_receiver(&self, queue: &str) -> Option<UnboundedReceiver<QueueMessage>> {
        let mut queues = self.queues.lock();
        queues
            .entry(queue.to_owned())
            .or_insert_with(QueueSlot::new)
            .rx
            .take()
    }
}

/// Spawn `parallelism` consumer tasks for `queue`, each invoking `handler`
/// per message. A failed handler schedules a redelivery after
/// `2^attempt` seconds, up to [`MAX_ATTEMPTS`].
pub fn spawn_consumers<F, Fut>(hub: Arc<QueueHub>, queue: &str, parallelism: usize, handler: F)
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = mt_domain::Result<()>> + Send + 'static,
{
    let Some(rx) = hub.take_receiver(queue) else {
        tracing::error!(queue, "queue already has consumers");
        return;
    };
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    for _ in 0..parallelism.max(1) {
        let rx = rx.clone();
        let hub = hub.clone();
        let handler = handler.clone();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            loop {
                let msg = { rx.lock().await.recv().await };
                let Some(msg) = msg else { break };

                if let Err(e) = handler(msg.payload.clone()).await {
                    let next = msg.attempt + 1;
                    if next >= MAX_ATTEMPTS {
                        tracing::error!(
                            queue = %queue,
                            attempts = next,
                            error = %e,
                            "message dropped after max delivery attempts"
                        );
                        continue;
                    }
                    let delay = std::time::Duration::from_secs(1u64 << next);
                    tracing::warn!(
                        queue = %queue,
                        attempt = next,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "handler failed, scheduling redelivery"
                    );
                    let hub = hub.clone();
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        hub.publish_message(
                            &queue,
                            QueueMessage {
                                attempt: next,
                                payload: msg.payload,
                            },
                        );
                    });
                }
            }
        });
    }
}
