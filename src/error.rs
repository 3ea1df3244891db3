//! Error taxonomy for queue operations and handler invocations.
//!
//! Each enum exposes `as_label` so log lines can carry a short stable
//! field next to the human-readable message.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the queue client adapter.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// Connectivity or service failure; the caller retries with a
    /// backoff.
    #[error("transient queue error: {0}")]
    Transient(String),

    /// The queue does not exist (or no longer exists). Fatal for the
    /// binding that refers to it.
    #[error("queue {0:?} not found")]
    NotFound(String),
}

impl QueueError {
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::Transient(_) => "queue_transient",
            QueueError::NotFound(_) => "queue_not_found",
        }
    }
}

/// A failed message deletion. Best-effort: logged and skipped.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("couldn't acknowledge message with receipt handle {receipt_handle:?}: {reason}")]
pub struct AckError {
    pub receipt_handle: String,
    pub reason: String,
}

/// Errors produced while invoking a handler. Every variant results in
/// the batch being left on the queue.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The handler reference doesn't resolve to a file under the
    /// runtime root.
    #[error("handler file not found: {0:?}")]
    HandlerNotFound(PathBuf),

    /// The handler ran past the invocation timeout and was killed.
    #[error("handler timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The runtime process couldn't be started or written to.
    #[error("couldn't run the handler runtime: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker answered something that isn't a valid response, or
    /// died mid-invocation.
    #[error("worker protocol error: {0}")]
    Protocol(String),
}

impl InvokeError {
    pub fn as_label(&self) -> &'static str {
        match self {
            InvokeError::HandlerNotFound(_) => "handler_not_found",
            InvokeError::Timeout { .. } => "invocation_timeout",
            InvokeError::Spawn(_) => "runtime_spawn",
            InvokeError::Protocol(_) => "worker_protocol",
        }
    }
}
