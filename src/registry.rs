//! Queue registry
//!
//! Holds the current set of known queues for one project, each with an
//! optional resource hint and an in-flight worker count. The refresher
//! reconciles the set against the provider's authoritative list with
//! [`Registry::align`]; the producer reads ranked snapshots with
//! [`Registry::rank`]. All mutation happens under a single mutex and no
//! method performs I/O while holding it.

use crate::error::{RunnerError, RunnerResult};
use crate::resource::Resource;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct QueueState {
    resource_hint: Option<Resource>,
    in_flight: u32,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub name: String,
    pub in_flight: u32,
    pub resource_hint: Option<Resource>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
}

/// Thread-safe registry of the queues visible to this scheduler instance.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the registry to exactly `expected`.
    ///
    /// Added queues start with zero in-flight workers and no resource
    /// hint. Removed queues are discarded; a worker already processing one
    /// runs to completion but the queue is never re-offered. Returns the
    /// added and removed names, each sorted.
    pub fn align(&self, expected: &HashSet<String>) -> (Vec<String>, Vec<String>) {
        let mut queues = self.inner.queues.lock();

        let mut removed: Vec<String> = queues
            .keys()
            .filter(|name| !expected.contains(*name))
            .cloned()
            .collect();
        for name in &removed {
            queues.remove(name);
        }

        let mut added: Vec<String> = expected
            .iter()
            .filter(|name| !queues.contains_key(*name))
            .cloned()
            .collect();
        for name in &added {
            queues.insert(name.clone(), QueueState::default());
        }

        added.sort();
        removed.sort();
        (added, removed)
    }

    /// Snapshot of all queues ordered ascending by in-flight count.
    ///
    /// Tie order is unspecified; the producer shuffles the admitted subset
    /// explicitly and callers must not rely on it.
    pub fn rank(&self) -> Vec<QueueSnapshot> {
        let queues = self.inner.queues.lock();
        let mut snapshot: Vec<QueueSnapshot> = queues
            .iter()
            .map(|(name, state)| QueueSnapshot {
                name: name.clone(),
                in_flight: state.in_flight,
                resource_hint: state.resource_hint,
            })
            .collect();
        snapshot.sort_by_key(|queue| queue.in_flight);
        snapshot
    }

    /// Snapshot of a single queue, `None` when it is not registered.
    pub fn lookup(&self, name: &str) -> Option<QueueSnapshot> {
        let queues = self.inner.queues.lock();
        queues.get(name).map(|state| QueueSnapshot {
            name: name.to_string(),
            in_flight: state.in_flight,
            resource_hint: state.resource_hint,
        })
    }

    /// Record the nominal resource requirement last seen for `name`.
    pub fn set_resource(&self, name: &str, hint: Resource) -> RunnerResult<()> {
        if hint.is_empty() {
            return Err(RunnerError::InvalidArgument(format!(
                "empty resource hint for queue {name}"
            )));
        }
        let mut queues = self.inner.queues.lock();
        match queues.get_mut(name) {
            Some(state) => {
                state.resource_hint = Some(hint);
                Ok(())
            }
            None => Err(RunnerError::QueueUnknown(name.to_string())),
        }
    }

    /// Clone of the queue's resource hint, `None` when the queue is
    /// unknown or has no hint yet.
    pub fn get_resource(&self, name: &str) -> Option<Resource> {
        let queues = self.inner.queues.lock();
        queues.get(name).and_then(|state| state.resource_hint)
    }

    /// Mark one worker in flight for `name`, decremented when the guard
    /// drops. `None` when the queue is not registered.
    pub fn checkout(&self, name: &str) -> Option<InFlightGuard> {
        let mut queues = self.inner.queues.lock();
        let state = queues.get_mut(name)?;
        state.in_flight += 1;
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queues.lock().is_empty()
    }
}

/// RAII in-flight marker returned by [`Registry::checkout`].
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut queues = self.inner.queues.lock();
        // The queue may have been aligned away while the worker ran.
        if let Some(state) = queues.get_mut(&self.name) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}
