//! Consumer loop
//!
//! Serializes admission: the consumer is the only component that admits
//! work into execution. It drains the handshake channel, ignores probes,
//! re-checks the backoff for real requests, inserts the short
//! self-suppression backoff so other queues get a turn, and spawns the
//! worker. A panicking worker is caught and logged here, the crate's
//! second panic boundary, and never brings the loop down.

use crate::backoff::{backoff_key, BackoffCache};
use crate::config::Intervals;
use crate::error::panic_message;
use crate::registry::Registry;
use crate::taskqueue::{MsgHandler, SubRequest, TaskQueue};
use crate::worker::{do_work, WorkerDeps};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub(crate) struct Consumer {
    pub rx: mpsc::Receiver<SubRequest>,
    pub registry: Registry,
    pub backoffs: BackoffCache,
    pub provider: Arc<dyn TaskQueue>,
    pub handler: Arc<dyn MsgHandler>,
    pub intervals: Intervals,
}

impl Consumer {
    /// Drain handshake offers until the channel closes or `quit` fires,
    /// then wait for in-flight workers to finish.
    pub async fn run(mut self, quit: CancellationToken) {
        let workers = TaskTracker::new();

        loop {
            tokio::select! {
                _ = quit.cancelled() => break,
                request = self.rx.recv() => match request {
                    None => break,
                    Some(request) if request.is_probe() => continue,
                    Some(request) => self.filter_work(request, &workers, &quit),
                }
            }
        }

        workers.close();
        workers.wait().await;
    }

    fn filter_work(&self, request: SubRequest, workers: &TaskTracker, quit: &CancellationToken) {
        let subject = backoff_key(&request.project, &request.subscription);

        // The producer checked this before offering, but the admission
        // decision belongs here; drop anything that cooled down since.
        if self.backoffs.contains(&subject) {
            debug!(%subject, "dropping admitted queue that is backed off");
            return;
        }
        // Self-suppression: one admission per queue per window.
        self.backoffs.set(subject.clone(), self.intervals.self_suppress);

        let guard = self.registry.checkout(&request.subscription);
        let deps = WorkerDeps {
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            backoffs: self.backoffs.clone(),
            handler: self.handler.clone(),
            intervals: self.intervals,
        };
        let token = quit.child_token();

        debug!(%subject, "admitting queue");
        workers.spawn(async move {
            let _in_flight = guard;
            if let Err(panic) = AssertUnwindSafe(do_work(deps, request, token))
                .catch_unwind()
                .await
            {
                warn!(%subject, panic = %panic_message(panic), "worker panicked");
            }
        });
    }
}
