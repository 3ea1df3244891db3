//! Defines the read-only application state derived from settings.

use crate::conf::Settings;
use crate::invoke::{HandlerRef, Runtime, RuntimeInvokerFactory};
use crate::poller::PollerConfig;
use crate::supervisor::SupervisorConfig;
use anyhow::{anyhow, Context, Result};
use envy::from_env;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// The largest batch the queue service delivers in one receive.
const MAX_BATCH_SIZE: i32 = 10;

/// The longest long-polling wait the queue service accepts.
const MAX_WAIT_TIME_SECONDS: i32 = 20;

/// A queue bound to the handler invoked with its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub handler: HandlerRef,
    pub batch_size: i32,
    pub visibility_timeout: i32,
}

impl QueueBinding {
    /// Parse a `queue-name=path/to/module.export` pair.
    fn parse(pair: &str, batch_size: i32, visibility_timeout: i32) -> Result<Self> {
        let (queue_name, handler) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("queue binding {:?} is not a queue=handler pair", pair))?;
        let queue_name = queue_name.trim();
        if queue_name.is_empty() {
            return Err(anyhow!("queue binding {:?} has no queue name", pair));
        }
        Ok(QueueBinding {
            queue_name: String::from(queue_name),
            handler: HandlerRef::parse(handler.trim())?,
            batch_size,
            visibility_timeout,
        })
    }
}

/// An App is an initialized application state, derived from
/// settings.
pub struct App {
    /// The settings read from the environment.
    pub settings: Settings,

    /// The queues to poll, each with its handler.
    pub bindings: Vec<QueueBinding>,

    /// The runtime handlers are executed with.
    pub runtime: Arc<Runtime>,
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Result<Self> {
        if !(1..=MAX_BATCH_SIZE).contains(&settings.batch_size) {
            return Err(anyhow!(
                "BATCH_SIZE must be between 1 and {}, got {}",
                MAX_BATCH_SIZE,
                settings.batch_size
            ));
        }
        if !(0..=MAX_WAIT_TIME_SECONDS).contains(&settings.wait_time_seconds) {
            return Err(anyhow!(
                "WAIT_TIME_SECONDS must be between 0 and {}, got {}",
                MAX_WAIT_TIME_SECONDS,
                settings.wait_time_seconds
            ));
        }
        // Parse bindings
        let mut bindings = Vec::with_capacity(settings.queue_handlers.len());
        for pair in settings
            .queue_handlers
            .iter()
            .filter(|pair| !pair.trim().is_empty())
        {
            let binding =
                QueueBinding::parse(pair, settings.batch_size, settings.visibility_timeout)?;
            if bindings
                .iter()
                .any(|b: &QueueBinding| b.queue_name == binding.queue_name)
            {
                return Err(anyhow!("queue {:?} is bound twice", binding.queue_name));
            }
            bindings.push(binding);
        }
        // Parse the runtime command and handler environment
        let command = shell_words::split(&settings.runtime_command)
            .context("RUNTIME_COMMAND is not a valid command line")?;
        let mut env = Vec::with_capacity(settings.handler_env.len());
        for pair in settings.handler_env.iter().filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("HANDLER_ENV entry {:?} is not KEY=VALUE", pair))?;
            env.push((String::from(key), String::from(value)));
        }
        let runtime = Runtime::node(command, &settings.handler_extension, env)?;
        // Done
        Ok(App {
            settings,
            bindings,
            runtime: Arc::new(runtime),
        })
    }

    /// The maximum log level.
    pub fn log_level(&self) -> Result<Level> {
        Level::from_str(&self.settings.log_level)
            .map_err(|_| anyhow!("invalid LOG_LEVEL {:?}", self.settings.log_level))
    }

    /// The folder handler references are resolved against.
    pub fn handler_root(&self) -> PathBuf {
        PathBuf::from(&self.settings.handler_root)
    }

    /// Timing and retry parameters shared by every poll loop.
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            wait_time_seconds: self.settings.wait_time_seconds,
            poll_interval: Duration::from_secs(self.settings.poll_interval),
            error_backoff: Duration::from_secs(self.settings.poll_interval),
            invocation_timeout: Duration::from_secs(self.settings.invocation_timeout),
            resolve_attempts: self.settings.resolve_attempts,
            resolve_delay: Duration::from_secs(self.settings.connect_delay),
            region: self.settings.aws_region.clone(),
            event_source: self.settings.event_source.clone(),
        }
    }

    /// Startup and re-resolution parameters of the supervisor.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_attempts: self.settings.connect_attempts,
            connect_delay: Duration::from_secs(self.settings.connect_delay),
            resolve_retry_interval: Duration::from_secs(self.settings.resolve_retry_interval),
        }
    }

    /// The factory of the invokers owned by each poll loop.
    pub fn invoker_factory(&self) -> RuntimeInvokerFactory {
        RuntimeInvokerFactory {
            runtime: self.runtime.clone(),
            root: self.handler_root(),
            mode: self.settings.invocation_mode,
            reload: self.settings.worker_reload,
        }
    }

    /// Build a binding outside of the configured set, with the
    /// configured batch size and visibility timeout.
    pub fn binding(&self, queue_name: &str, handler: &str) -> Result<QueueBinding> {
        QueueBinding::parse(
            &format!("{}={}", queue_name, handler),
            self.settings.batch_size,
            self.settings.visibility_timeout,
        )
    }
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub fn init() -> Result<()> {
    let settings = from_env().context("Invalid configuration")?;
    let app = App::new(settings)?;
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
