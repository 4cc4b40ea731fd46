//! Inbound message sources.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use crate::error::SagaError;
use crate::message::Message;

/// A message handed to a worker, with the number of times it has been
/// delivered (starting at 1).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub attempt: u32,
}

/// Where workers pull messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next delivery. Returns `None` once the source is
    /// closed and drained.
    ///
    /// Must be cancel safe: if the future is dropped before it completes,
    /// no message is lost.
    async fn receive(&self) -> Option<Delivery>;

    /// Reports that the delivery was processed.
    async fn ack(&self, delivery: Delivery);

    /// Reports that dispatching the delivery failed with `error`.
    async fn nack(&self, delivery: Delivery, error: &SagaError);
}

/// A message that exhausted its delivery attempts or failed permanently.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Message,
    pub attempts: u32,
    pub error: String,
}

/// Returned by [`InMemoryQueue::send`] after the queue was closed.
#[derive(Debug, Error)]
#[error("queue is closed")]
pub struct QueueClosed(pub Message);

/// In-process FIFO message source.
///
/// Retryable failures are requeued at the back until the message has been
/// delivered `max_delivery_attempts` times; after that, and for failures
/// that are not retryable, the message is moved to the dead-letter list.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    readable: Notify,
    idle: Notify,
    max_delivery_attempts: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    in_flight: usize,
    acked: u64,
    dead_letters: Vec<DeadLetter>,
    closed: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight == 0
    }
}

impl InMemoryQueue {
    /// Creates an open queue that gives up on a message after
    /// `max_delivery_attempts` deliveries.
    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                readable: Notify::new(),
                idle: Notify::new(),
                max_delivery_attempts: max_delivery_attempts.max(1),
            }),
        }
    }

    /// Enqueues a message for its first delivery.
    pub fn send(&self, message: Message) -> Result<(), QueueClosed> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueClosed(message));
        }
        state.ready.push_back(Delivery {
            message,
            attempt: 1,
        });
        drop(state);
        self.inner.readable.notify_one();
        Ok(())
    }

    /// Stops accepting messages. Receivers drain what is left and then see
    /// `None`.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.readable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Messages waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Total number of acknowledged deliveries.
    pub fn acked(&self) -> u64 {
        self.state().acked
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    /// Waits until nothing is pending or in flight. Returns false if that
    /// did not happen within `timeout`.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.inner.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.state().is_idle() {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, mut state: MutexGuard<'_, QueueState>) {
        state.in_flight = state.in_flight.saturating_sub(1);
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self) -> Option<Delivery> {
        loop {
            let readable = self.inner.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(delivery) = state.ready.pop_front() {
                    state.in_flight += 1;
                    return Some(delivery);
                }
                if state.closed {
                    return None;
                }
            }

            readable.await;
        }
    }

    async fn ack(&self, _delivery: Delivery) {
        let mut state = self.state();
        state.acked += 1;
        self.settle(state);
    }

    async fn nack(&self, delivery: Delivery, error: &SagaError) {
        let mut state = self.state();
        if error.is_retryable() && delivery.attempt < self.inner.max_delivery_attempts {
            tracing::debug!(
                message_id = %delivery.message.id,
                attempt = delivery.attempt,
                error = %error,
                "requeueing message"
            );
            state.ready.push_back(Delivery {
                message: delivery.message,
                attempt: delivery.attempt + 1,
            });
            self.settle(state);
            self.inner.readable.notify_one();
            return;
        }

        tracing::warn!(
            message_id = %delivery.message.id,
            message_type = %delivery.message.message_type,
            attempts = delivery.attempt,
            error = %error,
            "message dead-lettered"
        );
        state.dead_letters.push(DeadLetter {
            message: delivery.message,
            attempts: delivery.attempt,
            error: error.to_string(),
        });
        self.settle(state);
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryQueue")
            .field("pending", &state.ready.len())
            .field("in_flight", &state.in_flight)
            .field("acked", &state.acked)
            .field("dead_letters", &state.dead_letters.len())
            .field("closed", &state.closed)
            .finish()
    }
}
