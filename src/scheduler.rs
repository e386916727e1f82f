//! Scheduler assembly
//!
//! Owns the registry, the backoff cache, and the handshake channel, and
//! runs the three control loops: refresher, producer, and consumer. The
//! scheduler is memoryless across restarts; everything it knows is
//! rebuilt from the provider on the first refresh.

use crate::backoff::BackoffCache;
use crate::config::RunnerConfig;
use crate::consumer::Consumer;
use crate::error::RunnerResult;
use crate::handler::{MsgAdapter, Processor};
use crate::machine::{MachineInventory, NoGpus, SysInventory};
use crate::notify::{LogNotifier, Notifier};
use crate::producer::Producer;
use crate::refresher::Refresher;
use crate::registry::Registry;
use crate::taskqueue::{Credentials, TaskQueue};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Scheduler {
    config: RunnerConfig,
    provider: Arc<dyn TaskQueue>,
    processor: Arc<dyn Processor>,
    inventory: Arc<dyn MachineInventory>,
    notifier: Arc<dyn Notifier>,
    registry: Registry,
    backoffs: BackoffCache,
}

impl Scheduler {
    /// Build a scheduler over the given provider and processor.
    ///
    /// Must be called from within a tokio runtime; the backoff sweeper
    /// starts here.
    pub fn new(
        config: RunnerConfig,
        provider: Arc<dyn TaskQueue>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        let inventory = Arc::new(SysInventory::new(
            config.limits,
            config.workdir.clone(),
            Arc::new(NoGpus),
        ));
        let backoffs = BackoffCache::new(config.intervals.sweep);
        Self {
            config,
            provider,
            processor,
            inventory,
            notifier: Arc::new(LogNotifier),
            registry: Registry::new(),
            backoffs,
        }
    }

    /// Replace the machine inventory, e.g. with a GPU-aware one or a
    /// fixed one in tests.
    pub fn with_inventory(mut self, inventory: Arc<dyn MachineInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    /// Replace the operator notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backoffs(&self) -> &BackoffCache {
        &self.backoffs
    }

    /// Run until `quit` fires or the refresher fails.
    ///
    /// The refresher's error is the return value; producer and consumer
    /// errors never propagate (they become backoff insertions). On exit
    /// every in-flight worker has returned.
    pub async fn run(self, quit: CancellationToken) -> RunnerResult<()> {
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(
            %host,
            project = %self.config.project,
            max_cpus = self.config.limits.max_cpus,
            max_ram = self.config.limits.max_ram,
            max_disk = self.config.limits.max_disk,
            "scheduler starting"
        );

        let creds = Credentials {
            project: self.config.project.clone(),
            key_file: self.config.credentials_file.clone(),
        };
        let (tx, rx) = mpsc::channel(1);
        let scope = quit.child_token();

        let consumer = Consumer {
            rx,
            registry: self.registry.clone(),
            backoffs: self.backoffs.clone(),
            provider: self.provider.clone(),
            handler: Arc::new(MsgAdapter::new(self.processor.clone())),
            intervals: self.config.intervals,
        };
        let consumer_handle = tokio::spawn(consumer.run(scope.clone()));

        let producer = Producer {
            project: self.config.project.clone(),
            creds,
            registry: self.registry.clone(),
            backoffs: self.backoffs.clone(),
            inventory: self.inventory.clone(),
            notifier: self.notifier.clone(),
            intervals: self.config.intervals,
            tx,
            rng: SmallRng::from_entropy(),
        };
        let producer_handle = tokio::spawn(producer.run(scope.clone()));

        let refresher = Refresher {
            project: self.config.project.clone(),
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
            intervals: self.config.intervals,
        };
        let result = refresher.run(scope.clone()).await;

        // Wind down the loops whether we are quitting or the refresher
        // failed; the consumer waits out its workers before returning.
        scope.cancel();
        let _ = producer_handle.await;
        let _ = consumer_handle.await;

        match &result {
            Ok(()) => info!(project = %self.config.project, "scheduler stopped"),
            Err(err) => error!(project = %self.config.project, %err, "scheduler stopped on refresh failure"),
        }
        result
    }
}
