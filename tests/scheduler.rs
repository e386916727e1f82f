//! End-to-end scheduler scenarios against an in-memory provider.
//!
//! All timing runs on tokio's virtual clock; nothing here sleeps for
//! real.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_runner::{
    Credentials, ExperimentEnvelope, FixedInventory, MsgHandler, Notifier, NotifyEvent,
    ProcessError, ProcessOutcome, Processor, Resource, RunnerConfig, RunnerResult, Scheduler,
    TaskQueue, WorkReport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, sleep, timeout};
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;

/// Channel-fed provider: scripted refresh lists, per-queue message
/// queues, existence derived from the most recent refresh.
struct MockProvider {
    refreshes: Mutex<VecDeque<HashSet<String>>>,
    current: Mutex<HashSet<String>>,
    messages: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    work_calls: Mutex<HashMap<String, u32>>,
    acked: AtomicU32,
}

impl MockProvider {
    fn new(refreshes: Vec<HashSet<String>>) -> Arc<Self> {
        Arc::new(Self {
            refreshes: Mutex::new(refreshes.into()),
            current: Mutex::new(HashSet::new()),
            messages: Mutex::new(HashMap::new()),
            work_calls: Mutex::new(HashMap::new()),
            acked: AtomicU32::new(0),
        })
    }

    fn push_message(&self, queue: &str, payload: &[u8]) {
        self.messages
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
    }

    fn work_calls(&self, queue: &str) -> u32 {
        self.work_calls.lock().get(queue).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for MockProvider {
    async fn refresh(&self, _timeout: Duration) -> RunnerResult<HashSet<String>> {
        let mut refreshes = self.refreshes.lock();
        let next = if refreshes.len() > 1 {
            refreshes.pop_front().unwrap()
        } else {
            refreshes.front().cloned().unwrap_or_default()
        };
        *self.current.lock() = next.clone();
        Ok(next)
    }

    async fn exists(&self, _ctx: &CancellationToken, name: &str) -> RunnerResult<bool> {
        Ok(self.current.lock().contains(name))
    }

    async fn work(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        name: &str,
        _max_jobs: u32,
        handler: &dyn MsgHandler,
    ) -> RunnerResult<WorkReport> {
        *self.work_calls.lock().entry(name.to_string()).or_default() += 1;

        let mut report = WorkReport::default();
        loop {
            if ctx.is_cancelled() {
                return Ok(report);
            }
            let payload = self
                .messages
                .lock()
                .get_mut(name)
                .and_then(|queue| queue.pop_front());
            match payload {
                Some(payload) => {
                    let (hint, consume) = handler
                        .handle(ctx, "proj", name, &Credentials::default(), &payload)
                        .await;
                    report.processed += 1;
                    if hint.is_some() {
                        report.resource_hint = hint;
                    }
                    if consume {
                        self.acked.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.messages
                            .lock()
                            .entry(name.to_string())
                            .or_default()
                            .push_front(payload);
                    }
                }
                None => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(report),
                        _ = sleep(timeout) => return Ok(report),
                    }
                }
            }
        }
    }
}

enum Script {
    Ack,
    /// Hold the message for the given span, then ack.
    SlowAck(Duration),
    /// Hold the message until cancelled, then report retryable.
    HangUntilCancel,
}

struct MockProcessor(Script);

#[async_trait]
impl Processor for MockProcessor {
    async fn process(
        &self,
        ctx: &CancellationToken,
        _request: ExperimentEnvelope,
        _resources: Resource,
        _creds: &Credentials,
    ) -> Result<ProcessOutcome, ProcessError> {
        match &self.0 {
            Script::Ack => {}
            Script::SlowAck(span) => {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        return Err(ProcessError {
                            ack: false,
                            source: anyhow::anyhow!("cancelled"),
                        })
                    }
                    _ = sleep(*span) => {}
                }
            }
            Script::HangUntilCancel => {
                ctx.cancelled().await;
                return Err(ProcessError {
                    ack: false,
                    source: anyhow::anyhow!("cancelled"),
                });
            }
        }
        Ok(ProcessOutcome {
            ack: true,
            broadcast: false,
        })
    }
}

#[derive(Default)]
struct CountingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl CountingNotifier {
    fn no_work_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, NotifyEvent::NoWork { .. }))
            .count()
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify(&self, event: NotifyEvent) {
        self.events.lock().push(event);
    }
}

fn config() -> RunnerConfig {
    RunnerConfig {
        project: "proj".into(),
        credentials_file: "/dev/null".into(),
        workdir: "/tmp".into(),
        ..RunnerConfig::default()
    }
}

fn plenty() -> Resource {
    Resource {
        cpus: 64,
        ram: u64::MAX,
        disk: u64::MAX,
        gpus: 8,
        gpu_mem: u64::MAX,
    }
}

fn names(list: &[&str]) -> HashSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

const PAYLOAD_SMALL: &[u8] =
    br#"{"experiment": {"key": "expt-1", "resource": {"cpus": 1, "ram": "1gib"}}}"#;

// One queue, one message: the hint lands in the registry, the message
// is acked, and the liveness watcher arms the five-minute cooldown
// while work runs.
#[tokio::test(start_paused = true)]
async fn happy_path_records_hint_and_cooldown() {
    let provider = MockProvider::new(vec![names(&["qA"])]);
    provider.push_message("qA", PAYLOAD_SMALL);

    // Slow enough that work is still alive when the first liveness
    // probe fires at the one-minute mark.
    let scheduler = Scheduler::new(
        config(),
        provider.clone(),
        Arc::new(MockProcessor(Script::SlowAck(Duration::from_secs(70)))),
    )
    .with_inventory(Arc::new(FixedInventory(plenty())));
    let registry = scheduler.registry().clone();
    let backoffs = scheduler.backoffs().clone();

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    advance(Duration::from_secs(95)).await;

    assert_eq!(
        registry.get_resource("qA"),
        Some(Resource {
            cpus: 1,
            ram: GIB,
            ..Resource::default()
        })
    );
    assert_eq!(provider.acked.load(Ordering::SeqCst), 1);
    // Cooling backoff armed by the probe that saw work running.
    assert!(backoffs.contains("proj:qA"));

    quit.cancel();
    run.await.unwrap().unwrap();
}

// A queue that vanishes mid-flight is revoked by the liveness watcher
// and never admitted again.
#[tokio::test(start_paused = true)]
async fn vanishing_queue_is_revoked_and_not_readmitted() {
    let provider = MockProvider::new(vec![names(&["qA"]), names(&[])]);
    provider.push_message("qA", PAYLOAD_SMALL);

    let scheduler = Scheduler::new(
        config(),
        provider.clone(),
        Arc::new(MockProcessor(Script::HangUntilCancel)),
    )
    .with_inventory(Arc::new(FixedInventory(plenty())));
    let registry = scheduler.registry().clone();

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    // Admitted around t=15s, registry emptied by the t=61s refresh, the
    // watcher's probe finds the queue gone and cancels the pump.
    advance(Duration::from_secs(300)).await;

    assert_eq!(provider.work_calls("qA"), 1);
    assert!(registry.is_empty());
    // The hanging processor reported retryable on cancel, so the
    // message redelivered rather than being consumed.
    assert_eq!(provider.acked.load(Ordering::SeqCst), 0);

    quit.cancel();
    timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// A recorded hint pre-rejects a queue the host cannot fit while a
// hintless queue keeps flowing.
#[tokio::test(start_paused = true)]
async fn oversized_hint_blocks_requeue_while_hintless_flows() {
    let provider = MockProvider::new(vec![names(&["qB", "qC"])]);
    provider.push_message(
        "qB",
        br#"{"experiment": {"key": "big", "resource": {"gpus": 4, "gpuMem": "16gib"}}}"#,
    );

    // Largest single board: two GPUs.
    let host = Resource {
        cpus: 8,
        ram: u64::MAX,
        disk: u64::MAX,
        gpus: 2,
        gpu_mem: 16 * GIB,
    };
    let scheduler = Scheduler::new(
        config(),
        provider.clone(),
        Arc::new(MockProcessor(Script::Ack)),
    )
    .with_inventory(Arc::new(FixedInventory(host)));
    let registry = scheduler.registry().clone();
    let backoffs = scheduler.backoffs().clone();

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    advance(Duration::from_secs(800)).await;

    // The first admission had no hint and processed the message; every
    // admission since fails the capacity check.
    assert_eq!(provider.work_calls("qB"), 1);
    assert_eq!(registry.get_resource("qB").unwrap().gpus, 4);
    assert!(backoffs.contains("proj:qB"));
    // The hintless queue skipped the capacity check and kept polling.
    assert!(provider.work_calls("qC") >= 2);

    quit.cancel();
    run.await.unwrap().unwrap();
}

// Starved for an hour, the warning fires once and re-arms on a
// ten-minute cadence.
#[tokio::test(start_paused = true)]
async fn starvation_warning_rearms_every_ten_minutes() {
    let provider = MockProvider::new(vec![names(&[])]);
    let notifier = Arc::new(CountingNotifier::default());

    let scheduler = Scheduler::new(
        config(),
        provider,
        Arc::new(MockProcessor(Script::Ack)),
    )
    .with_inventory(Arc::new(FixedInventory(plenty())))
    .with_notifier(notifier.clone());

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    advance(Duration::from_secs(3590)).await;
    assert_eq!(notifier.no_work_count(), 0);

    advance(Duration::from_secs(30)).await;
    assert_eq!(notifier.no_work_count(), 1);

    // Not yet ten minutes since the re-arm.
    advance(Duration::from_secs(540)).await;
    assert_eq!(notifier.no_work_count(), 1);

    advance(Duration::from_secs(90)).await;
    assert_eq!(notifier.no_work_count(), 2);

    quit.cancel();
    run.await.unwrap().unwrap();
}

// Root cancellation reaches every worker: the scheduler returns with
// the hanging processor unwound, within the propagation bound.
#[tokio::test(start_paused = true)]
async fn root_cancellation_unwinds_in_flight_work() {
    let provider = MockProvider::new(vec![names(&["qA"])]);
    provider.push_message("qA", PAYLOAD_SMALL);

    let scheduler = Scheduler::new(
        config(),
        provider.clone(),
        Arc::new(MockProcessor(Script::HangUntilCancel)),
    )
    .with_inventory(Arc::new(FixedInventory(plenty())));

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    // Let the message get admitted and stuck in the processor.
    advance(Duration::from_secs(20)).await;
    assert_eq!(provider.work_calls("qA"), 1);

    quit.cancel();
    let result = timeout(Duration::from_secs(5), run).await;
    result.unwrap().unwrap().unwrap();
}

// Two aligned refreshes with the same list produce no notifications on
// the second pass.
#[tokio::test(start_paused = true)]
async fn unchanged_refresh_is_silent() {
    let provider = MockProvider::new(vec![names(&["qA"])]);
    let notifier = Arc::new(CountingNotifier::default());

    let scheduler = Scheduler::new(
        config(),
        provider,
        Arc::new(MockProcessor(Script::Ack)),
    )
    .with_inventory(Arc::new(FixedInventory(plenty())))
    .with_notifier(notifier.clone());

    let quit = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(quit.clone()));

    advance(Duration::from_secs(150)).await;

    let added = notifier
        .events
        .lock()
        .iter()
        .filter(|event| matches!(event, NotifyEvent::QueueAdded { .. }))
        .count();
    assert_eq!(added, 1);

    quit.cancel();
    run.await.unwrap().unwrap();
}
