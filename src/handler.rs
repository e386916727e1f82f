//! Per-message handler adapter
//!
//! The task-queue driver hands each raw message to [`MsgAdapter`], which
//! decodes the experiment envelope, extracts the declared resources,
//! bridges cancellation from the worker's token into a per-message child
//! token, invokes the external processor, and folds the outcome into the
//! driver's consume decision. This is one of the crate's two panic
//! boundaries: a panicking processor is recovered, the message treated as
//! poisonous and consumed.

use crate::error::panic_message;
use crate::payload::ExperimentEnvelope;
use crate::resource::Resource;
use crate::taskqueue::{Credentials, MsgHandler};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Result of a successful processor run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    /// `true`: the message is fully handled (success or permanent
    /// failure) and is removed from the queue.
    pub ack: bool,
    /// Opt the completion into external notification.
    pub broadcast: bool,
}

/// Processor failure, carrying its own consume decision.
#[derive(Error, Debug)]
#[error("processor failed (ack={ack}): {source}")]
pub struct ProcessError {
    /// `false`: the failure is retryable, redeliver the message.
    pub ack: bool,
    #[source]
    pub source: anyhow::Error,
}

/// The per-message execution engine, out of scope for this crate: it
/// materializes the experiment, downloads artifacts, runs the workload,
/// and uploads results.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        ctx: &CancellationToken,
        request: ExperimentEnvelope,
        resources: Resource,
        creds: &Credentials,
    ) -> Result<ProcessOutcome, ProcessError>;
}

/// Adapter between the driver's message callback and the [`Processor`].
pub struct MsgAdapter {
    processor: Arc<dyn Processor>,
}

impl MsgAdapter {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl MsgHandler for MsgAdapter {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        project: &str,
        subscription: &str,
        creds: &Credentials,
        payload: &[u8],
    ) -> (Option<Resource>, bool) {
        let correlation = Uuid::new_v4();
        let span = tracing::info_span!(
            "work_item",
            %correlation,
            subject = %format!("{project}:{subscription}"),
        );

        async {
            let envelope = match ExperimentEnvelope::decode(payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(%err, "dumping undecodable message");
                    return (None, true);
                }
            };

            let resources = match envelope.experiment.resource.clone().into_resource() {
                Ok(resources) => resources,
                Err(err) => {
                    warn!(key = %envelope.experiment.key, %err, "dumping message with malformed resources");
                    return (None, true);
                }
            };
            let hint = (!resources.is_empty()).then_some(resources);

            debug!(key = %envelope.experiment.key, %resources, "processing experiment");

            // Per-message token, cancelled by the worker's token through
            // parentage and on handler return through the guard.
            let ctx_p = ctx.child_token();
            let _cancel_on_return = ctx_p.clone().drop_guard();

            let slack_dest = envelope.config.runner.slack_dest.clone();
            let key = envelope.experiment.key.clone();
            let run = self.processor.process(&ctx_p, envelope, resources, creds);

            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(outcome)) => {
                    if outcome.broadcast {
                        info!(%key, %slack_dest, "completion broadcast requested");
                    }
                    (hint, outcome.ack)
                }
                Ok(Err(err)) if err.ack => {
                    warn!(%key, %err, "permanent processor failure, dumping message");
                    (hint, true)
                }
                Ok(Err(err)) => {
                    debug!(%key, %err, "retryable processor failure, message will redeliver");
                    (hint, false)
                }
                Err(panic) => {
                    warn!(%key, panic = %panic_message(panic), "processor panicked, dumping message");
                    (hint, true)
                }
            }
        }
        .instrument(span)
        .await
    }
}
