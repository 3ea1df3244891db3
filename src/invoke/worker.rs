//! A long-lived runtime process serving invocations one at a time.

use super::{HandlerRef, InvocationResult, Invoke, ResolvedHandler, Runtime, WorkerResponse};
use crate::error::InvokeError;
use crate::event::InvocationEvent;
use crate::sign::Snapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::spawn_blocking;
use tokio::time;
use tracing::{debug, info, instrument, warn};

/// How long a worker gets to exit after its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running worker process.
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// The build output as it was when the worker loaded the handler.
    snapshot: Option<Snapshot>,
    /// Removed when the worker is dropped.
    _script: NamedTempFile,
}

impl Worker {
    /// Send one event and read its response.
    async fn exchange(&mut self, payload: &str) -> Result<WorkerResponse, InvokeError> {
        self.stdin.write_all(payload.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        match self.stdout.next_line().await? {
            Some(line) => serde_json::from_str(&line).map_err(|e| {
                InvokeError::Protocol(format!("invalid response {:?}: {}", line, e))
            }),
            None => {
                let status = self.child.wait().await?;
                Err(InvokeError::Protocol(format!(
                    "worker exited mid-invocation with {}",
                    status
                )))
            }
        }
    }
}

/// Keeps one runtime process per queue, spawned on the first
/// invocation and replaced whenever it dies, times out, or (with
/// `reload`) the handler's build output changes.
pub struct WorkerInvoker {
    runtime: Arc<Runtime>,
    root: PathBuf,
    handler: HandlerRef,
    label: String,
    reload: bool,
    worker: Option<Worker>,
}

impl WorkerInvoker {
    pub fn new(
        runtime: Arc<Runtime>,
        root: PathBuf,
        handler: HandlerRef,
        label: String,
        reload: bool,
    ) -> Self {
        WorkerInvoker {
            runtime,
            root,
            handler,
            label,
            reload,
            worker: None,
        }
    }

    /// Take a snapshot of the folder holding the handler file. Failures
    /// only disable reloading.
    async fn snapshot(resolved: &ResolvedHandler) -> Option<Snapshot> {
        let dir = resolved.path.parent()?.to_path_buf();
        match spawn_blocking(move || Snapshot::take(&dir)).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                warn!("Couldn't snapshot the handler's build output: {:?}", e);
                None
            }
            Err(e) => {
                warn!("Snapshot task failed: {:?}", e);
                None
            }
        }
    }

    /// Whether the running worker loaded code that has changed since.
    async fn is_stale(&mut self) -> bool {
        let snapshot = match self.worker.as_ref().and_then(|w| w.snapshot.clone()) {
            Some(snapshot) => snapshot,
            None => return false,
        };
        match spawn_blocking(move || snapshot.differences()).await {
            Ok(Ok(differences)) => !differences.is_empty(),
            _ => false,
        }
    }

    /// Start a worker for the resolved handler.
    async fn spawn(&mut self, resolved: &ResolvedHandler) -> Result<Worker, InvokeError> {
        let snapshot = if self.reload {
            Self::snapshot(resolved).await
        } else {
            None
        };
        let script = self.runtime.write_script(&self.runtime.worker_script)?;
        let mut child = self
            .runtime
            .command(script.path(), &self.root)
            .arg(&resolved.path)
            .arg(&resolved.export)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InvokeError::Protocol(String::from("worker stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvokeError::Protocol(String::from("worker stdout unavailable")))?;

        // Anything the worker writes outside of an invocation ends up
        // on stderr.
        if let Some(stderr) = child.stderr.take() {
            let label = self.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(queue = %label, "[worker] {}", line);
                }
            });
        }
        info!(
            "Started worker for {} (pid {:?})",
            self.handler,
            child.id()
        );
        Ok(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            snapshot,
            _script: script,
        })
    }

    /// Kill the current worker, if any.
    async fn discard(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            if let Err(e) = worker.child.kill().await {
                debug!("Couldn't kill worker: {:?}", e);
            }
        }
    }
}

#[async_trait]
impl Invoke for WorkerInvoker {
    #[instrument(skip_all, fields(handler = %self.handler))]
    async fn invoke(
        &mut self,
        event: &InvocationEvent,
        timeout: Duration,
    ) -> Result<InvocationResult, InvokeError> {
        let resolved = self.handler.resolve(&self.root, &self.runtime.extension)?;
        let payload = serde_json::to_string(event)
            .map_err(|e| InvokeError::Protocol(format!("couldn't serialize event: {}", e)))?;

        if self.is_stale().await {
            info!("Handler build output changed; restarting worker");
            self.discard().await;
        }
        if self.worker.is_none() {
            self.worker = Some(self.spawn(&resolved).await?);
        }
        let worker = match self.worker.as_mut() {
            Some(worker) => worker,
            None => return Err(InvokeError::Protocol(String::from("no worker running"))),
        };

        let start = Instant::now();
        let outcome = time::timeout(timeout, worker.exchange(&payload)).await;
        let duration_ms = start.elapsed().as_millis();
        match outcome {
            Ok(Ok(response)) => Ok(InvocationResult {
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
                duration_ms,
            }),
            Ok(Err(e)) => {
                self.discard().await;
                Err(e)
            }
            Err(_) => {
                self.discard().await;
                Err(InvokeError::Timeout { timeout })
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let Worker {
                mut child, stdin, ..
            } = worker;
            drop(stdin);
            if time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                if let Err(e) = child.kill().await {
                    debug!("Couldn't kill worker: {:?}", e);
                }
            }
        }
    }
}
