//! Operator notification side channel
//!
//! Queue lifecycle and starvation events fan out through [`Notifier`];
//! the chat transport is an external collaborator. [`LogNotifier`] is the
//! default and writes the events to the log.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Events worth an operator's attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    QueueAdded { project: String, name: String },
    QueueRemoved { project: String, name: String },
    /// No queue yielded a dispatch for the starvation window.
    NoWork { project: String, idle_for: Duration },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// Default notifier: log and move on.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent) {
        match event {
            NotifyEvent::QueueAdded { project, name } => {
                info!(subject = %format!("{project}:{name}"), "queue added");
            }
            NotifyEvent::QueueRemoved { project, name } => {
                info!(subject = %format!("{project}:{name}"), "queue removed");
            }
            NotifyEvent::NoWork { project, idle_for } => {
                warn!(%project, idle_secs = idle_for.as_secs(), "no work dispatched");
            }
        }
    }
}
