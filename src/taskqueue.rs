//! Task-queue provider interface
//!
//! The cloud-specific driver (queue enumeration, message receive,
//! ack/nack) lives outside this crate; the scheduler consumes it through
//! [`TaskQueue`]. The driver calls back into the scheduler once per
//! message through [`MsgHandler`].

use crate::error::RunnerResult;
use crate::resource::Resource;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Credential material handed through to the driver and the processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Project identifier derived from the credentials.
    pub project: String,
    /// Path of the credentials file located via the environment.
    pub key_file: String,
}

/// Handshake token offered by the producer to the consumer.
///
/// Two shapes: a probe ("are you listening?") with empty project and
/// subscription, and a real request naming the queue to process now.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub project: String,
    pub subscription: String,
    pub creds: Credentials,
}

impl SubRequest {
    pub fn probe() -> Self {
        Self {
            project: String::new(),
            subscription: String::new(),
            creds: Credentials::default(),
        }
    }

    pub fn is_probe(&self) -> bool {
        self.subscription.is_empty()
    }
}

/// Per-message callback from the driver's receive loop.
#[async_trait]
pub trait MsgHandler: Send + Sync {
    /// Process one message.
    ///
    /// Returns the experiment's declared resources (so the registry can
    /// record a hint for the queue) and the consume decision: `true`
    /// acknowledges and removes the message, `false` lets it redeliver.
    /// The handler never fails outward; errors fold into the consume
    /// decision.
    async fn handle(
        &self,
        ctx: &CancellationToken,
        project: &str,
        subscription: &str,
        creds: &Credentials,
        payload: &[u8],
    ) -> (Option<Resource>, bool);
}

/// Count of messages processed and the last resource hint a handler
/// returned, as reported by one [`TaskQueue::work`] call.
#[derive(Debug, Clone, Default)]
pub struct WorkReport {
    pub processed: u64,
    pub resource_hint: Option<Resource>,
}

/// Cloud task-queue driver, as seen by the scheduler core.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// List all queues visible to the caller's credentials within the
    /// configured project.
    async fn refresh(&self, timeout: Duration) -> RunnerResult<HashSet<String>>;

    /// Existence probe for one queue.
    async fn exists(&self, ctx: &CancellationToken, name: &str) -> RunnerResult<bool>;

    /// Blocking receive loop for one queue.
    ///
    /// Calls `handler` once per message and returns when no message
    /// arrives within `timeout`, when `ctx` is cancelled, or when the
    /// provider fails. `max_jobs == 0` means "as many as the machine can
    /// hold".
    async fn work(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        name: &str,
        max_jobs: u32,
        handler: &dyn MsgHandler,
    ) -> RunnerResult<WorkReport>;
}
