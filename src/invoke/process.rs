//! One runtime process per invocation.

use super::{HandlerRef, InvocationResult, Invoke, Runtime};
use crate::error::InvokeError;
use crate::event::InvocationEvent;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, instrument};

/// Launches a fresh runtime process for each invocation. The bootstrap
/// script and the JSON event live in temporary files that are removed
/// however the invocation ends; the process gets the event file's path.
pub struct ProcessInvoker {
    runtime: Arc<Runtime>,
    root: PathBuf,
    handler: HandlerRef,
}

impl ProcessInvoker {
    pub fn new(runtime: Arc<Runtime>, root: PathBuf, handler: HandlerRef) -> Self {
        ProcessInvoker {
            runtime,
            root,
            handler,
        }
    }
}

#[async_trait]
impl Invoke for ProcessInvoker {
    #[instrument(skip_all, fields(handler = %self.handler))]
    async fn invoke(
        &mut self,
        event: &InvocationEvent,
        timeout: Duration,
    ) -> Result<InvocationResult, InvokeError> {
        let resolved = self.handler.resolve(&self.root, &self.runtime.extension)?;
        let payload = serde_json::to_string(event)
            .map_err(|e| InvokeError::Protocol(format!("couldn't serialize event: {}", e)))?;
        let script = self.runtime.write_script(&self.runtime.invoke_script)?;
        let event_file = self.runtime.write_event(&payload)?;
        debug!("Running handler file {:?}", resolved.path);

        let start = Instant::now();
        let child = self
            .runtime
            .command(script.path(), &self.root)
            .arg(&resolved.path)
            .arg(&resolved.export)
            .arg(event_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Dropping the child on timeout kills it.
        let output = time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| InvokeError::Timeout { timeout })??;
        Ok(InvocationResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis(),
        })
    }
}
