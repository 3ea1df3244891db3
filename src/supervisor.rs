//! # Supervisor: one poll loop per queue binding.
//!
//! ```text
//! run(bindings, token)
//!   preflight: ping ─► retry (fixed delay) ─► give up = fatal
//!   for each binding:
//!       set.spawn(PollLoop::run(token.child_token()))
//!   join_next_with_id():
//!       Unresolved ─► set.spawn(sleep(retry interval) then PollLoop::run)
//!       panicked   ─► same as Unresolved
//!       Stopped    ─► done with that binding
//!   token.cancel() ─► every loop finishes its in-flight batch and stops
//! ```
//!
//! Loops are independent: a binding whose queue can't be resolved is
//! retried on its own schedule without touching running loops, so
//! queues created after startup are eventually picked up.

use crate::app::QueueBinding;
use crate::client::QueueClient;
use crate::error::QueueError;
use crate::invoke::InvokerFactory;
use crate::poller::{LoopExit, PollLoop, PollerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Startup and re-resolution parameters.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Attempts of the connectivity check.
    pub connect_attempts: u32,
    /// Wait between connectivity check attempts.
    pub connect_delay: Duration,
    /// Wait before restarting a loop whose queue wasn't found.
    pub resolve_retry_interval: Duration,
}

/// Owns the poll loops of every binding.
pub struct Supervisor {
    config: SupervisorConfig,
    poller: Arc<PollerConfig>,
    client: Arc<dyn QueueClient>,
    invokers: Arc<dyn InvokerFactory>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        poller: PollerConfig,
        client: Arc<dyn QueueClient>,
        invokers: Arc<dyn InvokerFactory>,
    ) -> Self {
        Supervisor {
            config,
            poller: Arc::new(poller),
            client,
            invokers,
        }
    }

    /// Wait for the queue service to answer, a bounded amount of
    /// times. Returns `Ok` early if cancelled.
    pub async fn preflight(&self, token: &CancellationToken) -> Result<(), QueueError> {
        info!("Waiting for the queue service to be available...");
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.client.ping().await {
                Ok(()) => {
                    info!("Queue service is available");
                    return Ok(());
                }
                Err(e) if attempt == attempts => {
                    error!("Queue service not available: {}", e);
                    return Err(e);
                }
                Err(_) => {
                    info!("  Attempt {}/{}: Waiting...", attempt, attempts);
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = sleep(self.config.connect_delay) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a loop for `binding` after `delay`, remembering which
    /// binding the task serves.
    fn spawn_loop(
        &self,
        set: &mut JoinSet<LoopExit>,
        bindings: &mut HashMap<Id, QueueBinding>,
        binding: QueueBinding,
        delay: Duration,
        token: &CancellationToken,
    ) {
        let token = token.child_token();
        let poll_loop = PollLoop::new(
            binding.clone(),
            self.poller.clone(),
            self.client.clone(),
            self.invokers.build(&binding),
        );
        let handle = set.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return LoopExit::Stopped,
                    _ = sleep(delay) => {}
                }
            }
            poll_loop.run(token).await
        });
        bindings.insert(handle.id(), binding);
    }

    /// Run every binding's loop until `token` is cancelled and all
    /// loops have stopped. Fails only if the queue service can't be
    /// reached at startup.
    pub async fn run(
        &self,
        bindings: Vec<QueueBinding>,
        token: CancellationToken,
    ) -> Result<(), QueueError> {
        self.preflight(&token).await?;
        if token.is_cancelled() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        let mut running = HashMap::new();
        info!("Starting {} poller(s)", bindings.len());
        for binding in bindings {
            self.spawn_loop(&mut set, &mut running, binding, Duration::ZERO, &token);
        }
        if set.is_empty() {
            warn!("No queues configured; waiting for shutdown");
            token.cancelled().await;
            return Ok(());
        }

        while let Some(joined) = set.join_next_with_id().await {
            let (id, exit) = match joined {
                Ok((id, exit)) => (id, exit),
                Err(e) => {
                    error!("Poller task failed: {:?}", e);
                    (e.id(), LoopExit::Unresolved)
                }
            };
            let binding = match running.remove(&id) {
                Some(binding) => binding,
                None => continue,
            };
            match exit {
                LoopExit::Unresolved if !token.is_cancelled() => {
                    warn!(
                        "Poller for {} is down; retrying in {:?}",
                        binding.queue_name, self.config.resolve_retry_interval
                    );
                    self.spawn_loop(
                        &mut set,
                        &mut running,
                        binding,
                        self.config.resolve_retry_interval,
                        &token,
                    );
                }
                _ => info!("Poller for {} stopped", binding.queue_name),
            }
        }
        info!("All pollers stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{binding, message, poller_config, wait_until, FakeFactory, FakeQueue};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            connect_attempts: 3,
            connect_delay: Duration::from_millis(10),
            resolve_retry_interval: Duration::from_millis(30),
        }
    }

    fn supervisor(queue: &Arc<FakeQueue>, factory: &Arc<FakeFactory>) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            config(),
            poller_config(),
            queue.clone(),
            factory.clone(),
        ))
    }

    #[tokio::test]
    async fn unresolved_binding_is_retried_without_restarting_others() {
        let queue = Arc::new(FakeQueue::new(&["y"]));
        let factory = Arc::new(FakeFactory::default());
        let supervisor = supervisor(&queue, &factory);
        let token = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move { supervisor.run(vec![binding("x"), binding("y")], token).await })
        };

        queue.push("y", vec![message("y1", "ok")]);
        wait_until(|| queue.acks().contains(&String::from("rh-y1"))).await;
        wait_until(|| queue.resolves("x") >= 2).await;

        queue.create_queue("x");
        queue.push("x", vec![message("x1", "ok")]);
        wait_until(|| queue.acks().contains(&String::from("rh-x1"))).await;

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(factory.builds("y"), 1);
        assert_eq!(queue.resolves("y"), 1);
        assert!(factory.builds("x") >= 2);
    }

    #[tokio::test]
    async fn crashed_loop_is_restarted() {
        let queue = Arc::new(FakeQueue::new(&["payments"]));
        let factory = Arc::new(FakeFactory::default());
        let supervisor = supervisor(&queue, &factory);
        let token = CancellationToken::new();
        queue.push("payments", vec![message("m1", "panic")]);
        let handle = {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move { supervisor.run(vec![binding("payments")], token).await })
        };

        wait_until(|| factory.builds("payments") >= 2).await;
        queue.push("payments", vec![message("m2", "ok")]);
        wait_until(|| queue.acks().contains(&String::from("rh-m2"))).await;

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(!queue.acks().contains(&String::from("rh-m1")));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_invocations() {
        let queue = Arc::new(FakeQueue::new(&["payments"]));
        let factory = Arc::new(FakeFactory::with_delay(Duration::from_millis(200)));
        let supervisor = supervisor(&queue, &factory);
        let token = CancellationToken::new();
        queue.push("payments", vec![message("m1", "ok")]);
        let handle = {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move { supervisor.run(vec![binding("payments")], token).await })
        };

        wait_until(|| factory.probe.in_flight() == 1).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(queue.acks(), vec!["rh-m1"]);
        assert!(factory.probe.was_shut_down());
    }

    #[tokio::test]
    async fn unreachable_service_is_fatal() {
        let queue = Arc::new(FakeQueue::new(&["payments"]));
        queue.set_reachable(false);
        let factory = Arc::new(FakeFactory::default());
        let result = supervisor(&queue, &factory)
            .run(vec![binding("payments")], CancellationToken::new())
            .await;
        assert!(matches!(result, Err(QueueError::Transient(_))));
        assert_eq!(queue.pings(), 3);
        assert_eq!(factory.builds("payments"), 0);
    }

    #[tokio::test]
    async fn keeps_waiting_when_no_queue_resolves() {
        let queue = Arc::new(FakeQueue::new(&[]));
        let factory = Arc::new(FakeFactory::default());
        let supervisor = supervisor(&queue, &factory);
        let token = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move { supervisor.run(vec![binding("payments")], token).await })
        };

        wait_until(|| queue.resolves("payments") >= 3).await;
        assert!(!handle.is_finished());
        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(factory.probe.invocations(), 0);
    }

    #[tokio::test]
    async fn no_bindings_waits_for_shutdown() {
        let queue = Arc::new(FakeQueue::new(&[]));
        let factory = Arc::new(FakeFactory::default());
        let supervisor = supervisor(&queue, &factory);
        let token = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move { supervisor.run(Vec::new(), token).await })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
