//! Queue discovery, ranking, admission-control, and dispatch core for a
//! distributed experiment runner.
//!
//! The scheduler pulls experiment descriptions from cloud message
//! queues, matches them against the host's free resources, and
//! dispatches admitted jobs to a worker:
//! - A refresher aligns the queue [`Registry`] against the provider's
//!   authoritative list
//! - A producer ranks, shuffles, and offers idle queues to the consumer
//!   through a two-stage handshake
//! - The consumer admits queues and spawns workers; a per-queue liveness
//!   watcher revokes work mid-flight when a queue vanishes
//! - A TTL [`BackoffCache`] carries the negative "skip this queue"
//!   signal between the loops
//!
//! The cloud driver ([`TaskQueue`]) and the experiment execution engine
//! ([`Processor`]) are external collaborators.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod handler;
pub mod machine;
pub mod notify;
pub mod payload;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod taskqueue;
pub mod telemetry;

mod consumer;
mod producer;
mod refresher;
mod worker;

pub use backoff::{backoff_key, BackoffCache};
pub use config::{apply_env_overrides, Intervals, Limits, RunnerConfig};
pub use error::{RunnerError, RunnerResult};
pub use handler::{MsgAdapter, ProcessError, ProcessOutcome, Processor};
pub use machine::{FixedInventory, GpuCapacity, GpuProbe, MachineInventory, NoGpus, SysInventory};
pub use notify::{LogNotifier, Notifier, NotifyEvent};
pub use payload::{ExperimentEnvelope, ExperimentSpec, ResourceSpec};
pub use registry::{InFlightGuard, QueueSnapshot, Registry};
pub use resource::{parse_bytes, Resource};
pub use scheduler::Scheduler;
pub use taskqueue::{Credentials, MsgHandler, SubRequest, TaskQueue, WorkReport};
