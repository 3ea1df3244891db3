//! Defines the per-queue poll loop: receive a batch, build the event,
//! invoke the handler, and delete the messages if the handler
//! succeeded.
//!
//! ```text
//! Starting ──resolved──► Polling ──batch──► Invoking ──exit 0──► Acking
//!    │                    ▲  │ empty/error     │ failure            │
//!    │                    │  └─ wait ──┘       │                    │
//!    │                    └────────────────────┴────────────────────┘
//!    └──unresolved──► Stopping ◄──cancelled── (top of each iteration)
//!                        └──► Stopped
//! ```
//!
//! A batch is fully settled before the next receive starts, so at
//! most one invocation per queue is ever in flight. Failed batches
//! are left on the queue: they become visible again after the
//! visibility timeout, and dead-lettering is up to the queue's redrive
//! policy.

use crate::app::QueueBinding;
use crate::client::{QueueClient, QueueRef};
use crate::error::QueueError;
use crate::event::{translate, EventContext, InvocationEvent, RawMessage};
use crate::invoke::{log_output, Invoke};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Amount of empty polls between "still polling" log lines.
const HEARTBEAT_EVERY: u64 = 50;

/// Amount of characters of the first message body that get logged.
const BODY_PREVIEW_CHARS: usize = 500;

/// Timing and retry parameters of a poll loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Long-polling duration of each receive.
    pub wait_time_seconds: i32,
    /// Wait after an empty receive.
    pub poll_interval: Duration,
    /// Wait after a transient queue error.
    pub error_backoff: Duration,
    /// Hard limit on each handler invocation.
    pub invocation_timeout: Duration,
    /// Attempts at resolving the queue URL on start.
    pub resolve_attempts: u32,
    /// Wait between resolution attempts.
    pub resolve_delay: Duration,
    pub region: String,
    pub event_source: String,
}

/// The state of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Starting,
    Polling,
    Invoking,
    Acking,
    Stopping,
    Stopped,
}

/// Why a poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was requested.
    Stopped,
    /// The queue couldn't be resolved, or disappeared.
    Unresolved,
}

/// A poll loop bound to a single queue. It owns its state and its
/// invoker; only the queue client is shared with other loops.
pub struct PollLoop {
    binding: QueueBinding,
    config: Arc<PollerConfig>,
    client: Arc<dyn QueueClient>,
    invoker: Box<dyn Invoke>,
    state: PollerState,
    polls: u64,
}

impl PollLoop {
    pub fn new(
        binding: QueueBinding,
        config: Arc<PollerConfig>,
        client: Arc<dyn QueueClient>,
        invoker: Box<dyn Invoke>,
    ) -> Self {
        PollLoop {
            binding,
            config,
            client,
            invoker,
            state: PollerState::Starting,
            polls: 0,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    fn transition(&mut self, next: PollerState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Wait for `duration`, or less if cancelled. Returns whether the
    /// wait was cancelled.
    async fn pause(duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    /// Run the loop until cancelled or until the queue can't be
    /// resolved. The invoker is shut down before returning.
    #[instrument(name = "poller", skip_all, fields(queue = %self.binding.queue_name))]
    pub async fn run(mut self, token: CancellationToken) -> LoopExit {
        let exit = match self.start(&token).await {
            Ok(queue) => self.poll(&queue, &token).await,
            Err(exit) => exit,
        };
        self.transition(PollerState::Stopping);
        self.invoker.shutdown().await;
        self.transition(PollerState::Stopped);
        exit
    }

    /// Resolve the queue, retrying transient failures a bounded
    /// amount of times.
    async fn start(&mut self, token: &CancellationToken) -> Result<QueueRef, LoopExit> {
        let attempts = self.config.resolve_attempts.max(1);
        for attempt in 1..=attempts {
            if token.is_cancelled() {
                return Err(LoopExit::Stopped);
            }
            match self.client.resolve_queue_ref(&self.binding.queue_name).await {
                Ok(queue) => {
                    info!("Found queue: {} -> {}", queue.name, queue.url);
                    return Ok(queue);
                }
                Err(QueueError::NotFound(_)) => {
                    warn!("Queue not found: {}", self.binding.queue_name);
                    return Err(LoopExit::Unresolved);
                }
                Err(e) => {
                    warn!(
                        error = e.as_label(),
                        "Attempt {}/{} at resolving queue failed: {}", attempt, attempts, e
                    );
                    if attempt < attempts && Self::pause(self.config.resolve_delay, token).await {
                        return Err(LoopExit::Stopped);
                    }
                }
            }
        }
        Err(LoopExit::Unresolved)
    }

    /// Receive and settle batches until cancelled.
    async fn poll(&mut self, queue: &QueueRef, token: &CancellationToken) -> LoopExit {
        let context =
            EventContext::for_queue(queue, &self.config.region, &self.config.event_source);
        self.transition(PollerState::Polling);
        info!("Polling {} -> {}", queue.name, self.binding.handler);

        while !token.is_cancelled() {
            self.polls += 1;
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = self.client.receive(
                    queue,
                    self.binding.batch_size,
                    self.config.wait_time_seconds,
                    self.binding.visibility_timeout,
                ) => received,
            };
            match received {
                Ok(messages) if messages.is_empty() => {
                    if self.polls % HEARTBEAT_EVERY == 0 {
                        info!("Still polling... (poll #{})", self.polls);
                    }
                    Self::pause(self.config.poll_interval, token).await;
                }
                Ok(messages) => self.settle(queue, &context, messages).await,
                Err(QueueError::NotFound(_)) => {
                    warn!("Queue {} disappeared; stopping its poller", queue.name);
                    return LoopExit::Unresolved;
                }
                Err(e) => {
                    warn!(error = e.as_label(), "Error while polling {}: {}", queue.name, e);
                    Self::pause(self.config.error_backoff, token).await;
                }
            }
        }
        LoopExit::Stopped
    }

    /// Invoke the handler with a non-empty batch, and acknowledge the
    /// batch if it succeeded.
    async fn settle(&mut self, queue: &QueueRef, context: &EventContext, messages: Vec<RawMessage>) {
        info!("Received {} message(s)", messages.len());
        if let Some(first) = messages.first() {
            let preview: String = first.body.chars().take(BODY_PREVIEW_CHARS).collect();
            info!(message_id = %first.id, "First message body: {}", preview);
        }

        self.transition(PollerState::Invoking);
        let event = translate(messages, context);
        let message_ids: Vec<&str> = event
            .records
            .iter()
            .map(|r| r.message_id.as_str())
            .collect();
        info!("Invoking handler {}", self.binding.handler);
        match self
            .invoker
            .invoke(&event, self.config.invocation_timeout)
            .await
        {
            Ok(result) => {
                log_output(&result);
                if result.succeeded() {
                    let duration_ms = result.duration_ms as u64;
                    info!(duration_ms, "Handler executed successfully");
                    self.acknowledge(queue, &event).await;
                } else {
                    warn!(
                        exit_code = result.exit_code,
                        ?message_ids,
                        "Handler failed; messages will be retried after the visibility timeout"
                    );
                }
            }
            Err(e) => warn!(
                error = e.as_label(),
                ?message_ids,
                "Couldn't invoke handler: {}; messages will be retried after the visibility timeout",
                e
            ),
        }
        self.transition(PollerState::Polling);
    }

    /// Delete every message of the batch. Failures are logged and
    /// skipped.
    async fn acknowledge(&mut self, queue: &QueueRef, event: &InvocationEvent) {
        self.transition(PollerState::Acking);
        for record in &event.records {
            match self.client.acknowledge(queue, &record.receipt_handle).await {
                Ok(()) => info!(message_id = %record.message_id, "Message deleted"),
                Err(e) => warn!(message_id = %record.message_id, "{}", e),
            }
        }
    }
}
