//! Runner configuration
//!
//! Typed configuration handed to the scheduler by the (out-of-scope) CLI
//! layer: project scope, credentials, machine limits, and the scheduler
//! timing table. Environment overrides use the `RUNNER_` prefix and are
//! applied by [`apply_env_overrides`].

use crate::error::{RunnerError, RunnerResult};
use crate::resource::{parse_bytes, Resource};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the credentials file.
pub const ENV_CREDENTIALS: &str = "RUNNER_CREDENTIALS";
/// Environment variable overriding the project identifier.
pub const ENV_PROJECT: &str = "RUNNER_PROJECT";
/// Environment variables overriding machine limits.
pub const ENV_MAX_CPUS: &str = "RUNNER_MAX_CPUS";
pub const ENV_MAX_RAM: &str = "RUNNER_MAX_RAM";
pub const ENV_MAX_DISK: &str = "RUNNER_MAX_DISK";

/// Operator caps on what the machine may advertise as free.
///
/// Unset components are unbounded; the sampled availability is clamped
/// component-wise, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_cpus: u32,
    pub max_ram: u64,
    pub max_disk: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cpus: u32::MAX,
            max_ram: u64::MAX,
            max_disk: u64::MAX,
        }
    }
}

impl Limits {
    /// The limits expressed as a clamping [`Resource`]. GPU components are
    /// never capped here; board inventory is the GPU probe's business.
    pub fn as_resource(&self) -> Resource {
        Resource {
            cpus: self.max_cpus,
            ram: self.max_ram,
            disk: self.max_disk,
            gpus: u32::MAX,
            gpu_mem: u64::MAX,
        }
    }
}

/// Scheduler timing table.
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    /// Delay before the refresher's first alignment.
    pub refresh_initial: Duration,
    /// Gap between refresher iterations.
    pub refresh: Duration,
    /// Producer tick.
    pub produce: Duration,
    /// Bounded wait for the stage-2 handshake send.
    pub dispatch_timeout: Duration,
    /// Timeout handed to provider refresh/exists/work calls.
    pub provider_timeout: Duration,
    /// Gap between liveness probes while a worker runs.
    pub liveness: Duration,
    /// Self-suppression backoff inserted at admission.
    pub self_suppress: Duration,
    /// Backoff inserted when `check` fails.
    pub check_backoff: Duration,
    /// Cooldown re-armed by each liveness probe that finds the queue alive.
    pub cooling: Duration,
    /// Idle span after which the starvation warning fires.
    pub starvation: Duration,
    /// Re-arm gap between starvation warnings.
    pub starvation_rearm: Duration,
    /// Backoff cache sweep interval.
    pub sweep: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            refresh_initial: Duration::from_secs(1),
            refresh: Duration::from_secs(60),
            produce: Duration::from_secs(15),
            dispatch_timeout: Duration::from_secs(2),
            provider_timeout: Duration::from_secs(2),
            liveness: Duration::from_secs(60),
            self_suppress: Duration::from_secs(10),
            check_backoff: Duration::from_secs(60),
            cooling: Duration::from_secs(300),
            starvation: Duration::from_secs(3600),
            starvation_rearm: Duration::from_secs(600),
            sweep: Duration::from_secs(10),
        }
    }
}

/// Validated configuration the core receives from its caller.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Project namespace scoping the visible queues.
    pub project: String,
    /// Path of the credentials file, as located by the environment.
    pub credentials_file: String,
    /// Directory experiments unpack and run beneath; its filesystem
    /// supplies the free-disk sample.
    pub workdir: PathBuf,
    /// Machine limits.
    pub limits: Limits,
    /// Timing table.
    pub intervals: Intervals,
}

/// Overlay `RUNNER_*` environment variables onto `config`.
///
/// Unset variables leave the existing value; malformed values are
/// `InvalidArgument`.
pub fn apply_env_overrides(config: &mut RunnerConfig) -> RunnerResult<()> {
    if let Ok(project) = std::env::var(ENV_PROJECT) {
        config.project = project;
    }
    if let Ok(creds) = std::env::var(ENV_CREDENTIALS) {
        config.credentials_file = creds;
    }
    if let Ok(cpus) = std::env::var(ENV_MAX_CPUS) {
        config.limits.max_cpus = cpus.trim().parse().map_err(|_| {
            RunnerError::InvalidArgument(format!("{ENV_MAX_CPUS} is not a cpu count: {cpus:?}"))
        })?;
    }
    if let Ok(ram) = std::env::var(ENV_MAX_RAM) {
        config.limits.max_ram = parse_bytes(&ram)?;
    }
    if let Ok(disk) = std::env::var(ENV_MAX_DISK) {
        config.limits.max_disk = parse_bytes(&disk)?;
    }
    Ok(())
}
