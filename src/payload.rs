//! Experiment message payload
//!
//! Wire model of the JSON envelope experiments arrive in. Only the fields
//! the scheduler needs are modeled; everything else in the payload passes
//! through to the processor untouched via the raw bytes.

use crate::error::{RunnerError, RunnerResult};
use crate::resource::{parse_bytes, Resource};
use serde::Deserialize;

/// Declared resources as they appear on the wire: counts as numbers,
/// byte quantities as human unit strings ("16gb", "1.5TiB").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub ram: String,
    #[serde(default, alias = "hdd")]
    pub disk: String,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default, alias = "gpuMem")]
    pub gpu_mem: String,
}

impl ResourceSpec {
    /// Convert into the canonical byte-typed [`Resource`].
    ///
    /// Absent byte fields mean zero; present ones must parse, otherwise
    /// `InvalidArgument`.
    pub fn into_resource(self) -> RunnerResult<Resource> {
        let parse_optional = |text: String| -> RunnerResult<u64> {
            if text.trim().is_empty() {
                Ok(0)
            } else {
                parse_bytes(&text)
            }
        };
        Ok(Resource {
            cpus: self.cpus,
            ram: parse_optional(self.ram)?,
            disk: parse_optional(self.disk)?,
            gpus: self.gpus,
            gpu_mem: parse_optional(self.gpu_mem)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSpec {
    /// Stable identifier of the experiment across retries.
    pub key: String,
    #[serde(default)]
    pub resource: ResourceSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub project_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerSection {
    #[serde(default)]
    pub slack_dest: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSection {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub runner: RunnerSection,
}

/// The experiment request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentEnvelope {
    pub experiment: ExperimentSpec,
    #[serde(default)]
    pub config: ConfigSection,
}

impl ExperimentEnvelope {
    /// Decode an envelope from raw message bytes.
    pub fn decode(payload: &[u8]) -> RunnerResult<Self> {
        serde_json::from_slice(payload).map_err(|err| {
            RunnerError::InvalidArgument(format!("undecodable experiment payload: {err}"))
        })
    }
}
