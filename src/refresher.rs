//! Queue list refresher
//!
//! Periodically pulls the authoritative queue list from the provider and
//! reconciles the registry against it. Diffs are logged and fanned out to
//! the notifier once; empty diffs are silent. A refresh error is not
//! retried here, it aborts the loop and surfaces to the caller, which may
//! restart the component or exit.

use crate::config::Intervals;
use crate::error::RunnerResult;
use crate::notify::{Notifier, NotifyEvent};
use crate::registry::Registry;
use crate::taskqueue::TaskQueue;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub(crate) struct Refresher {
    pub project: String,
    pub provider: Arc<dyn TaskQueue>,
    pub registry: Registry,
    pub notifier: Arc<dyn Notifier>,
    pub intervals: Intervals,
}

impl Refresher {
    pub async fn run(self, quit: CancellationToken) -> RunnerResult<()> {
        tokio::select! {
            _ = quit.cancelled() => return Ok(()),
            _ = sleep(self.intervals.refresh_initial) => {}
        }

        loop {
            self.refresh_once().await?;

            tokio::select! {
                _ = quit.cancelled() => return Ok(()),
                _ = sleep(self.intervals.refresh) => {}
            }
        }
    }

    async fn refresh_once(&self) -> RunnerResult<()> {
        let expected = self
            .provider
            .refresh(self.intervals.provider_timeout)
            .await?;
        let (added, removed) = self.registry.align(&expected);

        if !added.is_empty() || !removed.is_empty() {
            info!(
                project = %self.project,
                added = ?added,
                removed = ?removed,
                known = self.registry.len(),
                "queue list changed"
            );
        }
        for name in added {
            self.notifier
                .notify(NotifyEvent::QueueAdded {
                    project: self.project.clone(),
                    name,
                })
                .await;
        }
        for name in removed {
            self.notifier
                .notify(NotifyEvent::QueueRemoved {
                    project: self.project.clone(),
                    name,
                })
                .await;
        }
        Ok(())
    }
}
