use anyhow::{anyhow, bail, Result};
use sqs_lambda_poller::client::{QueueClient, SqsQueueClient};
use sqs_lambda_poller::invoke::InvokerFactory;
use sqs_lambda_poller::poller::{LoopExit, PollLoop};
use sqs_lambda_poller::{app, signal};
use std::env::args;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const USAGE: &str = "Usage: poll-queue <queue_name> <handler_path>

Example:
  poll-queue dev-payments-queue dist/main.handler";

/// Poll a single queue and invoke a handler with its messages, until
/// interrupted. Exits with an error if the queue can't be found.
#[tokio::main]
async fn main() -> Result<()> {
    let mut args = args().skip(1);
    let (queue_name, handler) = match (args.next(), args.next()) {
        (Some(queue_name), Some(handler)) => (queue_name, handler),
        _ => bail!(USAGE),
    };

    app::init()?;
    let app = app::current();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level()?)
        .with_target(false)
        .init();

    if !app.handler_root().is_dir() {
        bail!("Handler root not found: {:?}", app.handler_root());
    }
    let binding = app.binding(&queue_name, &handler)?;
    let client = Arc::new(SqsQueueClient::from_settings(&app.settings).await);
    let queue = client
        .resolve_queue_ref(&queue_name)
        .await
        .map_err(|e| anyhow!("Error getting queue URL: {}", e))?;
    info!("Polling {} every {}s", queue.url, app.settings.poll_interval);
    info!("Press Ctrl+C to stop");

    let token = CancellationToken::new();
    signal::cancel_on_shutdown_signal(token.clone());
    let invoker = app.invoker_factory().build(&binding);
    let poll_loop = PollLoop::new(binding, Arc::new(app.poller_config()), client, invoker);
    match poll_loop.run(token).await {
        LoopExit::Stopped => Ok(()),
        LoopExit::Unresolved => bail!("Queue {:?} is no longer available", queue_name),
    }
}
