//! Per-queue worker
//!
//! One admitted queue runs as a pair of tasks: the task-pump, which sits
//! in the provider's blocking `work` call handing messages to the
//! handler, and the liveness watcher, which probes for the queue's
//! continued existence and revokes the worker mid-flight when the queue
//! vanishes. While work is running the watcher keeps re-arming the
//! queue's cooling backoff, so the queue stays suppressed for a cooldown
//! after the pump returns.

use crate::backoff::{backoff_key, BackoffCache};
use crate::config::Intervals;
use crate::error::RunnerError;
use crate::registry::Registry;
use crate::taskqueue::{MsgHandler, SubRequest, TaskQueue};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub provider: Arc<dyn TaskQueue>,
    pub registry: Registry,
    pub backoffs: BackoffCache,
    pub handler: Arc<dyn MsgHandler>,
    pub intervals: Intervals,
}

/// Process one admitted queue until it runs dry, is cancelled, or fails.
pub(crate) async fn do_work(deps: WorkerDeps, req: SubRequest, parent: CancellationToken) {
    let subject = backoff_key(&req.project, &req.subscription);
    let ctx_w = parent.child_token();
    // Cancels the token even when the pump unwinds, so the watcher never
    // outlives the worker.
    let _release = ctx_w.clone().drop_guard();

    let watcher = tokio::spawn(liveness_watch(
        deps.provider.clone(),
        deps.backoffs.clone(),
        ctx_w.clone(),
        req.subscription.clone(),
        subject.clone(),
        deps.intervals,
    ));

    let result = deps
        .provider
        .work(
            &ctx_w,
            deps.intervals.provider_timeout,
            &req.subscription,
            0,
            deps.handler.as_ref(),
        )
        .await;

    // Always release the watcher, the success path included. Cancelling
    // an already-cancelled token is a no-op.
    ctx_w.cancel();
    let _ = watcher.await;

    match result {
        Ok(report) => {
            debug!(%subject, processed = report.processed, "work call drained");
            if let Some(hint) = report.resource_hint {
                match deps.registry.set_resource(&req.subscription, hint) {
                    Ok(()) => debug!(%subject, %hint, "resource hint recorded"),
                    // The queue was aligned away mid-flight; nothing to
                    // record against.
                    Err(RunnerError::QueueUnknown(_)) => {
                        debug!(%subject, "queue removed while working")
                    }
                    Err(err) => warn!(%subject, %err, "failed to record resource hint"),
                }
            }
        }
        Err(err) if err.is_fatal() => error!(%subject, %err, "provider failed fatally"),
        Err(err) => warn!(%subject, %err, "work call failed"),
    }
}

async fn liveness_watch(
    provider: Arc<dyn TaskQueue>,
    backoffs: BackoffCache,
    ctx_w: CancellationToken,
    name: String,
    subject: String,
    intervals: Intervals,
) {
    loop {
        tokio::select! {
            _ = ctx_w.cancelled() => return,
            _ = sleep(intervals.liveness) => {}
        }

        match timeout(intervals.provider_timeout, provider.exists(&ctx_w, &name)).await {
            Ok(Ok(true)) => {
                // Re-arm the cooldown: the queue stays suppressed until
                // five minutes after the last probe that saw work alive.
                backoffs.set(subject.clone(), intervals.cooling);
            }
            Ok(Ok(false)) => {
                info!(%subject, "queue no longer exists, revoking worker");
                ctx_w.cancel();
                return;
            }
            Ok(Err(err)) => warn!(%subject, %err, "liveness probe failed"),
            Err(_) => warn!(%subject, "liveness probe timed out"),
        }
    }
}
