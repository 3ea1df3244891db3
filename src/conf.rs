//! Defines configuration as read from the environment.

use serde::Deserialize;

/// Default `sqs_endpoint` value.
fn default_sqs_endpoint() -> String {
    String::from("http://localhost:4566")
}

/// Default `aws_region` value.
fn default_aws_region() -> String {
    String::from("us-east-1")
}

/// Default `queue_handlers` value.
fn default_queue_handlers() -> Vec<String> {
    vec![String::from("dev-payments-queue=dist/main.handler")]
}

/// Default `handler_root` value.
fn default_handler_root() -> String {
    String::from("packages/backend")
}

/// Default `poll_interval` value, in seconds.
fn default_poll_interval() -> u64 {
    2
}

/// Default `wait_time_seconds` value.
fn default_wait_time_seconds() -> i32 {
    20
}

/// Default `batch_size` value.
fn default_batch_size() -> i32 {
    1
}

/// Default `visibility_timeout` value, in seconds.
fn default_visibility_timeout() -> i32 {
    30
}

/// Default `invocation_timeout` value, in seconds.
fn default_invocation_timeout() -> u64 {
    30
}

/// Default `runtime_command` value.
fn default_runtime_command() -> String {
    String::from("node")
}

/// Default `handler_extension` value.
fn default_handler_extension() -> String {
    String::from("js")
}

/// Default `handler_env` value.
fn default_handler_env() -> Vec<String> {
    vec![String::from("NODE_ENV=development")]
}

fn default_true() -> bool {
    true
}

/// Default `connect_attempts` value.
fn default_connect_attempts() -> u32 {
    30
}

/// Default `connect_delay` value, in seconds.
fn default_connect_delay() -> u64 {
    2
}

/// Default `resolve_attempts` value.
fn default_resolve_attempts() -> u32 {
    3
}

/// Default `resolve_retry_interval` value, in seconds.
fn default_resolve_retry_interval() -> u64 {
    5
}

/// Default `event_source` value.
fn default_event_source() -> String {
    String::from("aws:sqs")
}

/// Default `log_level` value.
fn default_log_level() -> String {
    String::from("info")
}

/// How handler processes are managed.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    /// One long-lived worker process per queue, fed one event at a
    /// time.
    #[default]
    Worker,

    /// A brand-new runtime process per invocation.
    Spawn,
}

/// The poller is configured to bind queues to handler functions,
/// poll them and invoke the handlers with the received messages. The
/// configuration must be given as environment variables.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// The queue service endpoint. Usually a LocalStack URL.
    #[serde(default = "default_sqs_endpoint")]
    pub sqs_endpoint: String,

    /// The region reported to the queue service and written into
    /// every event record.
    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    /// Queue to handler bindings, as comma-separated
    /// `queue-name=path/to/module.export` pairs.
    #[serde(default = "default_queue_handlers")]
    pub queue_handlers: Vec<String>,

    /// The folder handler references are resolved against. Handler
    /// processes run with this folder as working directory.
    #[serde(default = "default_handler_root")]
    pub handler_root: String,

    /// Seconds to wait after an empty receive, and after a transient
    /// queue error.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Long-polling duration of each receive call.
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: i32,

    /// Maximum amount of messages received and invoked together.
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,

    /// Visibility timeout requested on receive, in seconds.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: i32,

    /// Hard limit on a single handler invocation, in seconds.
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout: u64,

    /// Either `worker` or `spawn`.
    #[serde(default)]
    pub invocation_mode: InvocationMode,

    /// The runtime program and its leading arguments, split with
    /// shell-words rules.
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,

    /// The file extension appended to the module part of a handler
    /// reference.
    #[serde(default = "default_handler_extension")]
    pub handler_extension: String,

    /// Extra `KEY=VALUE` variables given to the handler process, on
    /// top of the inherited environment.
    #[serde(default = "default_handler_env")]
    pub handler_env: Vec<String>,

    /// Restart the worker when the handler's build output changes.
    #[serde(default = "default_true")]
    pub worker_reload: bool,

    /// Attempts of the connectivity check performed before polling.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Seconds between connectivity check attempts.
    #[serde(default = "default_connect_delay")]
    pub connect_delay: u64,

    /// Attempts at resolving a queue URL when a loop starts, when the
    /// failures are transient.
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,

    /// Seconds before an unresolved binding is tried again.
    #[serde(default = "default_resolve_retry_interval")]
    pub resolve_retry_interval: u64,

    /// The `eventSource` field of every record.
    #[serde(default = "default_event_source")]
    pub event_source: String,

    /// Maximum log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}
