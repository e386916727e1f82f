//! Producer loop
//!
//! Every tick the producer snapshots the registry in rank order, drops
//! queues that are already busy or backed off, shuffles the remainder,
//! caps it, and offers each survivor to the consumer through the
//! two-stage handshake. The rank steers work toward the least-loaded
//! queues; the shuffle spreads dispatch uniformly inside that band so a
//! crowd of equally idle queues does not suffer head-of-line effects.

use crate::backoff::{backoff_key, BackoffCache};
use crate::config::Intervals;
use crate::error::{RunnerError, RunnerResult};
use crate::machine::MachineInventory;
use crate::notify::{Notifier, NotifyEvent};
use crate::registry::{QueueSnapshot, Registry};
use crate::taskqueue::{Credentials, SubRequest};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on handshake offers per tick, bounding the provider-side
/// query rate.
pub(crate) const MAX_DISPATCH_PER_TICK: usize = 8;

/// Filter the ranked snapshot down to dispatchable queues, shuffle, cap.
///
/// Only the admitted subset is shuffled; the ranked snapshot itself stays
/// in rank order.
pub(crate) fn select_candidates(
    ranked: &[QueueSnapshot],
    backoffs: &BackoffCache,
    project: &str,
    rng: &mut impl Rng,
    cap: usize,
) -> Vec<String> {
    let mut candidates: Vec<String> = ranked
        .iter()
        .filter(|queue| queue.in_flight == 0)
        .filter(|queue| !backoffs.contains(&backoff_key(project, &queue.name)))
        .map(|queue| queue.name.clone())
        .collect();
    candidates.shuffle(rng);
    candidates.truncate(cap);
    candidates
}

pub(crate) struct Producer {
    pub project: String,
    pub creds: Credentials,
    pub registry: Registry,
    pub backoffs: BackoffCache,
    pub inventory: Arc<dyn MachineInventory>,
    pub notifier: Arc<dyn Notifier>,
    pub intervals: Intervals,
    pub tx: mpsc::Sender<SubRequest>,
    /// Per-instance seeded, non-cryptographic; replicas must not shuffle
    /// in lockstep.
    pub rng: SmallRng,
}

impl Producer {
    pub async fn run(mut self, quit: CancellationToken) {
        let mut ticker = interval(self.intervals.produce);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // last_ready re-arms on each starvation warning; last_ready_abs
        // moves only on a real dispatch and reports the true idle span.
        let mut last_ready = Instant::now();
        let mut last_ready_abs = Instant::now();

        loop {
            tokio::select! {
                _ = quit.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.tick(&mut last_ready, &mut last_ready_abs).await;
        }
    }

    async fn tick(&mut self, last_ready: &mut Instant, last_ready_abs: &mut Instant) {
        let ranked = self.registry.rank();
        let picked = select_candidates(
            &ranked,
            &self.backoffs,
            &self.project,
            &mut self.rng,
            MAX_DISPATCH_PER_TICK,
        );

        for name in picked {
            match self.check(&name).await {
                Ok(()) => {
                    let now = Instant::now();
                    *last_ready = now;
                    *last_ready_abs = now;
                }
                Err(err) => {
                    let subject = backoff_key(&self.project, &name);
                    match &err {
                        RunnerError::DoesNotFit { .. } => info!(%subject, %err, "queue skipped"),
                        _ => debug!(%subject, %err, "queue skipped"),
                    }
                    self.backoffs.set(subject, self.intervals.check_backoff);
                    // One failed handshake ends the tick; remaining
                    // candidates wait for the next one.
                    break;
                }
            }
        }

        if last_ready.elapsed() >= self.intervals.starvation {
            let idle_for = last_ready_abs.elapsed();
            warn!(
                project = %self.project,
                idle_secs = idle_for.as_secs(),
                "no queue has yielded work for over an hour"
            );
            self.notifier
                .notify(NotifyEvent::NoWork {
                    project: self.project.clone(),
                    idle_for,
                })
                .await;
            *last_ready += self.intervals.starvation_rearm;
        }
    }

    /// The producer→consumer handoff for one queue.
    async fn check(&self, name: &str) -> RunnerResult<()> {
        // Stage 1: non-blocking liveness probe. A consumer that has not
        // drained the slot is busy; do not spin on it.
        if self.tx.try_send(SubRequest::probe()).is_err() {
            return Err(RunnerError::ConsumerBusy { stage: 1 });
        }

        // The snapshot may race a removal.
        let snapshot = self
            .registry
            .lookup(name)
            .ok_or_else(|| RunnerError::QueueUnknown(name.to_string()))?;

        if let Some(hint) = snapshot.resource_hint {
            let avail = self.inventory.free();
            if !hint.fit(&avail) {
                return Err(RunnerError::DoesNotFit {
                    queue: name.to_string(),
                    diff: hint.shortfall(&avail).join(", "),
                });
            }
        }

        // Stage 2: the real offer, bounded wait.
        let request = SubRequest {
            project: self.project.clone(),
            subscription: name.to_string(),
            creds: self.creds.clone(),
        };
        self.tx
            .send_timeout(request, self.intervals.dispatch_timeout)
            .await
            .map_err(|_| RunnerError::ConsumerBusy { stage: 2 })
    }
}
