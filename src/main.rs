use anyhow::{Context, Result};
use sqs_lambda_poller::client::SqsQueueClient;
use sqs_lambda_poller::supervisor::Supervisor;
use sqs_lambda_poller::{app, signal};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll every configured queue and invoke the bound handlers with the
/// received messages, until a termination signal arrives.
#[tokio::main]
async fn main() -> Result<()> {
    app::init()?;
    let app = app::current();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level()?)
        .with_target(false)
        .init();

    info!("SQS Lambda Poller Service");
    info!("SQS endpoint: {}", app.settings.sqs_endpoint);
    info!("Region: {}", app.settings.aws_region);
    info!("Poll interval: {}s", app.settings.poll_interval);
    info!("Handler root: {}", app.settings.handler_root);
    info!("Invocation mode: {:?}", app.settings.invocation_mode);
    for binding in &app.bindings {
        info!("  {} -> {}", binding.queue_name, binding.handler);
    }
    if !app.handler_root().is_dir() {
        warn!(
            "Handler root {:?} not found; invocations will fail until it exists",
            app.handler_root()
        );
    }

    let client = Arc::new(SqsQueueClient::from_settings(&app.settings).await);
    let supervisor = Supervisor::new(
        app.supervisor_config(),
        app.poller_config(),
        client,
        Arc::new(app.invoker_factory()),
    );
    let token = CancellationToken::new();
    signal::cancel_on_shutdown_signal(token.clone());

    supervisor
        .run(app.bindings.clone(), token)
        .await
        .context("Couldn't start polling")
}
