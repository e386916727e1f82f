//! Error types for the runner core

use thiserror::Error;

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error taxonomy for the scheduler core
///
/// Producer/consumer loop errors translate into backoff insertions at the
/// call site and never propagate; refresher errors propagate to the caller.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Registry lookup raced a removal
    #[error("queue {0} is not known to the registry")]
    QueueUnknown(String),

    /// Empty resource hint, malformed units, or similar caller mistakes
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Producer→consumer handshake failed; stage 1 is the liveness probe,
    /// stage 2 the bounded-wait dispatch
    #[error("consumer busy at handshake stage {stage}")]
    ConsumerBusy { stage: u8 },

    /// Capacity check failed against live machine resources
    #[error("queue {queue} does not fit on this machine: {diff}")]
    DoesNotFit { queue: String, diff: String },

    /// Task-queue provider failure; transient errors retry on the next
    /// tick, fatal ones (auth failure, missing project) end the process
    #[error("provider error: {source}")]
    Provider {
        fatal: bool,
        #[source]
        source: anyhow::Error,
    },
}

impl RunnerError {
    /// Wrap a provider error that the next tick may retry.
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        RunnerError::Provider {
            fatal: false,
            source: source.into(),
        }
    }

    /// Wrap a provider error that cannot be retried.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        RunnerError::Provider {
            fatal: true,
            source: source.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunnerError::Provider { fatal: true, .. })
    }
}

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fatal_flag_distinguishes_provider_errors() {
        assert!(RunnerError::fatal(anyhow::anyhow!("bad credentials")).is_fatal());
        assert!(!RunnerError::transient(anyhow::anyhow!("connection reset")).is_fatal());
        assert!(!RunnerError::QueueUnknown("q".into()).is_fatal());
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("boom"))), "boom");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }
}
