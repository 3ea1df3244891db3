//! Runs handler functions out of process.
//!
//! A handler is referenced as `path/to/module.export`, resolved
//! against a runtime root folder. The invocation event crosses the
//! process boundary serialized as JSON, and only the exit status of
//! the handler decides whether the batch is acknowledged.
//!
//! Two strategies exist: [`WorkerInvoker`] keeps one runtime process
//! alive per queue and feeds it events over a line-based channel,
//! while [`ProcessInvoker`] launches a new process per invocation.

mod process;
mod worker;

pub use process::ProcessInvoker;
pub use worker::WorkerInvoker;

use crate::app::QueueBinding;
use crate::conf::InvocationMode;
use crate::error::InvokeError;
use crate::event::InvocationEvent;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fs::canonicalize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{info, warn};

/// Node.js bootstrap running a single invocation.
const NODE_INVOKE_SCRIPT: &str = include_str!("bootstrap/invoke.js");

/// Node.js bootstrap serving invocations over stdin/stdout.
const NODE_WORKER_SCRIPT: &str = include_str!("bootstrap/worker.js");

/// A handler locator: a module path relative to the runtime root,
/// without extension, and the name of the exported entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRef {
    pub module: String,
    pub export: String,
}

impl HandlerRef {
    /// Parse a reference such as `dist/main.handler`.
    pub fn parse(reference: &str) -> Result<Self> {
        let (module, export) = reference
            .rsplit_once('.')
            .ok_or_else(|| anyhow!("handler reference {:?} has no entry point", reference))?;
        if module.is_empty() || export.is_empty() || export.contains('/') {
            return Err(anyhow!("invalid handler reference {:?}", reference));
        }
        Ok(HandlerRef {
            module: String::from(module),
            export: String::from(export),
        })
    }

    /// Find the handler's file under `root`.
    pub fn resolve(&self, root: &Path, extension: &str) -> Result<ResolvedHandler, InvokeError> {
        let path = root.join(format!("{}.{}", self.module, extension));
        let path = canonicalize(&path).map_err(|_| InvokeError::HandlerNotFound(path))?;
        if !path.is_file() {
            return Err(InvokeError::HandlerNotFound(path));
        }
        Ok(ResolvedHandler {
            path,
            export: self.export.clone(),
        })
    }
}

impl std::fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.export)
    }
}

/// A handler whose file exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub path: PathBuf,
    pub export: String,
}

/// The runtime used to execute handlers: a program, its leading
/// arguments, and the bootstrap scripts it's given.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub program: String,
    pub args: Vec<String>,

    /// Extension of handler modules, and of the bootstrap scripts.
    pub extension: String,

    /// Script run as `<script> <handler> <export> <event-file>`,
    /// exiting with the handler's status.
    pub invoke_script: String,

    /// Script run as `<script> <handler> <export>`, reading one JSON
    /// event per line on stdin and answering one [`WorkerResponse`]
    /// per line on stdout.
    pub worker_script: String,

    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,

    /// Where bootstrap scripts and event files are written. Defaults
    /// to the system's temporary folder.
    pub script_dir: Option<PathBuf>,
}

impl Runtime {
    /// The Node.js runtime. `command` holds the program followed by
    /// its leading arguments.
    pub fn node(command: Vec<String>, extension: &str, env: Vec<(String, String)>) -> Result<Self> {
        let mut command = command.into_iter();
        let program = command
            .next()
            .ok_or_else(|| anyhow!("empty runtime command"))?;
        Ok(Runtime {
            program,
            args: command.collect(),
            extension: String::from(extension),
            invoke_script: String::from(NODE_INVOKE_SCRIPT),
            worker_script: String::from(NODE_WORKER_SCRIPT),
            env,
            script_dir: None,
        })
    }

    /// Prepare a command running `script` in `root`.
    fn command(&self, script: &Path, root: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(script)
            .current_dir(root)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        command
    }

    /// Write a bootstrap script to a temporary file, removed when the
    /// returned handle is dropped.
    fn write_script(&self, contents: &str) -> std::io::Result<NamedTempFile> {
        let suffix = format!(".{}", self.extension);
        self.write_temp("sqs_invoke_", &suffix, contents)
    }

    /// Write a serialized event to a temporary file, removed when the
    /// returned handle is dropped. Events can outgrow the limit on a
    /// single command line argument.
    fn write_event(&self, payload: &str) -> std::io::Result<NamedTempFile> {
        self.write_temp("sqs_event_", ".json", payload)
    }

    fn write_temp(
        &self,
        prefix: &str,
        suffix: &str,
        contents: &str,
    ) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let mut file = match &self.script_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// The outcome of a handler run that completed within its timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl InvocationResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single line answered by a worker.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkerResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Something able to run a handler with an event.
#[async_trait]
pub trait Invoke: Send {
    /// Run the handler with `event`, killing it if it runs longer
    /// than `timeout`.
    async fn invoke(
        &mut self,
        event: &InvocationEvent,
        timeout: Duration,
    ) -> Result<InvocationResult, InvokeError>;

    /// Release any process held by the invoker.
    async fn shutdown(&mut self) {}
}

/// Builds the invoker owned by each poll loop.
pub trait InvokerFactory: Send + Sync {
    fn build(&self, binding: &QueueBinding) -> Box<dyn Invoke>;
}

/// The invoker factory configured from settings.
pub struct RuntimeInvokerFactory {
    pub runtime: Arc<Runtime>,
    pub root: PathBuf,
    pub mode: InvocationMode,
    pub reload: bool,
}

impl InvokerFactory for RuntimeInvokerFactory {
    fn build(&self, binding: &QueueBinding) -> Box<dyn Invoke> {
        match self.mode {
            InvocationMode::Worker => Box::new(WorkerInvoker::new(
                self.runtime.clone(),
                self.root.clone(),
                binding.handler.clone(),
                binding.queue_name.clone(),
                self.reload,
            )),
            InvocationMode::Spawn => Box::new(ProcessInvoker::new(
                self.runtime.clone(),
                self.root.clone(),
                binding.handler.clone(),
            )),
        }
    }
}

/// Log the output captured from a handler, line by line.
pub fn log_output(result: &InvocationResult) {
    for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
        info!("  {}", line);
    }
    for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
        warn!("  {}", line);
    }
}
