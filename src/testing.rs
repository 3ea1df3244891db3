//! In-memory queue and invoker used by the poller and supervisor
//! tests.

use crate::app::QueueBinding;
use crate::client::{QueueClient, QueueRef};
use crate::error::{AckError, InvokeError, QueueError};
use crate::event::{InvocationEvent, RawMessage};
use crate::invoke::{HandlerRef, InvocationResult, Invoke, InvokerFactory};
use crate::poller::PollerConfig;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// How long an empty receive blocks, standing in for long polling.
const FAKE_LONG_POLL: Duration = Duration::from_millis(5);

pub fn poller_config() -> PollerConfig {
    PollerConfig {
        wait_time_seconds: 0,
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        invocation_timeout: Duration::from_secs(1),
        resolve_attempts: 2,
        resolve_delay: Duration::from_millis(10),
        region: String::from("us-east-1"),
        event_source: String::from("aws:sqs"),
    }
}

pub fn binding(queue_name: &str) -> QueueBinding {
    QueueBinding {
        queue_name: String::from(queue_name),
        handler: HandlerRef::parse("dist/main.handler").unwrap(),
        batch_size: 10,
        visibility_timeout: 30,
    }
}

pub fn message(id: &str, body: &str) -> RawMessage {
    RawMessage {
        id: String::from(id),
        receipt_handle: format!("rh-{}", id),
        body: String::from(body),
        ..Default::default()
    }
}

/// Collects what `tracing` logs at info level and above on the
/// current thread, while the guard returned by `install` lives.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || capture.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[derive(Default)]
struct QueueState {
    reachable: bool,
    existing: HashSet<String>,
    batches: HashMap<String, VecDeque<Vec<RawMessage>>>,
    failing_receives: HashMap<String, u32>,
    failing_acks: HashSet<String>,
    acks: Vec<String>,
    receives: HashMap<String, u32>,
    resolves: HashMap<String, u32>,
    pings: u32,
}

/// A scripted queue service. Each receive pops the next pushed batch.
pub struct FakeQueue {
    state: Mutex<QueueState>,
}

impl FakeQueue {
    pub fn new(existing: &[&str]) -> Self {
        FakeQueue {
            state: Mutex::new(QueueState {
                reachable: true,
                existing: existing.iter().map(|q| q.to_string()).collect(),
                ..Default::default()
            }),
        }
    }

    pub fn create_queue(&self, name: &str) {
        self.state.lock().unwrap().existing.insert(String::from(name));
    }

    pub fn delete_queue(&self, name: &str) {
        self.state.lock().unwrap().existing.remove(name);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn push(&self, queue: &str, batch: Vec<RawMessage>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .entry(String::from(queue))
            .or_default()
            .push_back(batch);
    }

    /// Make the next `count` receives on `queue` fail transiently.
    pub fn fail_receives(&self, queue: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_receives
            .insert(String::from(queue), count);
    }

    pub fn fail_ack(&self, receipt_handle: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_acks
            .insert(String::from(receipt_handle));
    }

    /// Receipt handles acknowledged so far, in order.
    pub fn acks(&self) -> Vec<String> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn receives(&self, queue: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .receives
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn resolves(&self, queue: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .resolves
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn pings(&self) -> u32 {
        self.state.lock().unwrap().pings
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.pings += 1;
        if state.reachable {
            Ok(())
        } else {
            Err(QueueError::Transient(String::from("connection refused")))
        }
    }

    async fn resolve_queue_ref(&self, queue_name: &str) -> Result<QueueRef, QueueError> {
        let mut state = self.state.lock().unwrap();
        *state.resolves.entry(String::from(queue_name)).or_default() += 1;
        if !state.reachable {
            return Err(QueueError::Transient(String::from("connection refused")));
        }
        if !state.existing.contains(queue_name) {
            return Err(QueueError::NotFound(String::from(queue_name)));
        }
        Ok(QueueRef {
            name: String::from(queue_name),
            url: format!("http://localhost:4566/000000000000/{}", queue_name),
        })
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: i32,
        _wait_seconds: i32,
        _visibility_timeout: i32,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let batch = {
            let mut state = self.state.lock().unwrap();
            *state.receives.entry(queue.name.clone()).or_default() += 1;
            if !state.existing.contains(&queue.name) {
                return Err(QueueError::NotFound(queue.name.clone()));
            }
            if let Some(remaining) = state.failing_receives.get_mut(&queue.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(QueueError::Transient(String::from("connection reset")));
                }
            }
            state
                .batches
                .get_mut(&queue.name)
                .and_then(|batches| batches.pop_front())
                .unwrap_or_default()
        };
        assert!(batch.len() <= max_messages as usize);
        if batch.is_empty() {
            sleep(FAKE_LONG_POLL).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&self, _queue: &QueueRef, receipt_handle: &str) -> Result<(), AckError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_acks.contains(receipt_handle) {
            return Err(AckError {
                receipt_handle: String::from(receipt_handle),
                reason: String::from("throttled"),
            });
        }
        state.acks.push(String::from(receipt_handle));
        Ok(())
    }
}

/// Counters shared between a fake invoker and the test observing it.
#[derive(Default)]
pub struct InvokerProbe {
    invocations: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shut_down: AtomicBool,
    events: Mutex<Vec<InvocationEvent>>,
}

impl InvokerProbe {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<InvocationEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// An invoker whose outcome depends on the first record's body:
/// `fail` exits with 1, `timeout` times out, `panic` panics, anything
/// else succeeds.
pub struct FakeInvoker {
    probe: Arc<InvokerProbe>,
    delay: Duration,
}

impl FakeInvoker {
    pub fn new() -> Self {
        FakeInvoker {
            probe: Arc::new(InvokerProbe::default()),
            delay: Duration::ZERO,
        }
    }

    fn with_probe(probe: Arc<InvokerProbe>, delay: Duration) -> Self {
        FakeInvoker { probe, delay }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<InvokerProbe> {
        self.probe.clone()
    }
}

#[async_trait]
impl Invoke for FakeInvoker {
    async fn invoke(
        &mut self,
        event: &InvocationEvent,
        timeout: Duration,
    ) -> Result<InvocationResult, InvokeError> {
        self.probe.invocations.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        self.probe.events.lock().unwrap().push(event.clone());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);

        let exit_code = match event.records.first().map(|r| r.body.as_str()) {
            Some("timeout") => return Err(InvokeError::Timeout { timeout }),
            Some("fail") => 1,
            Some("panic") => panic!("invoker crashed"),
            _ => 0,
        };
        Ok(InvocationResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: self.delay.as_millis(),
        })
    }

    async fn shutdown(&mut self) {
        self.probe.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Builds fake invokers sharing one probe, counting builds per queue.
#[derive(Default)]
pub struct FakeFactory {
    pub probe: Arc<InvokerProbe>,
    pub delay: Duration,
    builds: Mutex<HashMap<String, usize>>,
}

impl FakeFactory {
    pub fn with_delay(delay: Duration) -> Self {
        FakeFactory {
            delay,
            ..Default::default()
        }
    }

    pub fn builds(&self, queue: &str) -> usize {
        self.builds
            .lock()
            .unwrap()
            .get(queue)
            .copied()
            .unwrap_or(0)
    }
}

impl InvokerFactory for FakeFactory {
    fn build(&self, binding: &QueueBinding) -> Box<dyn Invoke> {
        *self
            .builds
            .lock()
            .unwrap()
            .entry(binding.queue_name.clone())
            .or_default() += 1;
        Box::new(FakeInvoker::with_probe(self.probe.clone(), self.delay))
    }
}
