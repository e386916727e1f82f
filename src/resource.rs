//! Machine resource quantities and the fit predicate
//!
//! A [`Resource`] is a nominal requirement or a sampled availability:
//! CPU slots, RAM, disk, GPU slots, and GPU memory. Fitting is the
//! component-wise `<=` comparison between a requirement and what the host
//! has free; GPU components are compared against a single board (multi-GPU
//! jobs are never split across boards).

use crate::error::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource quantities, RAM/disk/GPU memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub cpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub gpus: u32,
    pub gpu_mem: u64,
}

impl Resource {
    /// True when every component is zero. Empty hints are rejected by the
    /// registry rather than stored.
    pub fn is_empty(&self) -> bool {
        self.cpus == 0 && self.ram == 0 && self.disk == 0 && self.gpus == 0 && self.gpu_mem == 0
    }

    /// Component-wise fit of `self` (the requirement) into `avail`.
    pub fn fit(&self, avail: &Resource) -> bool {
        self.cpus <= avail.cpus
            && self.ram <= avail.ram
            && self.disk <= avail.disk
            && self.gpus <= avail.gpus
            && self.gpu_mem <= avail.gpu_mem
    }

    /// Human-readable list of components that do not fit, empty when
    /// `fit` would return true.
    pub fn shortfall(&self, avail: &Resource) -> Vec<String> {
        let mut diff = Vec::new();
        if self.cpus > avail.cpus {
            diff.push(format!("cpus {} > {} free", self.cpus, avail.cpus));
        }
        if self.ram > avail.ram {
            diff.push(format!(
                "ram {} > {} free",
                format_bytes(self.ram),
                format_bytes(avail.ram)
            ));
        }
        if self.disk > avail.disk {
            diff.push(format!(
                "disk {} > {} free",
                format_bytes(self.disk),
                format_bytes(avail.disk)
            ));
        }
        if self.gpus > avail.gpus {
            diff.push(format!(
                "gpus {} > {} free on the largest board",
                self.gpus, avail.gpus
            ));
        }
        if self.gpu_mem > avail.gpu_mem {
            diff.push(format!(
                "gpu_mem {} > {} free on the largest board",
                format_bytes(self.gpu_mem),
                format_bytes(avail.gpu_mem)
            ));
        }
        diff
    }

    /// Component-wise minimum, used to clamp sampled availability to the
    /// operator-configured limits.
    pub fn clamp_to(&self, limit: &Resource) -> Resource {
        Resource {
            cpus: self.cpus.min(limit.cpus),
            ram: self.ram.min(limit.ram),
            disk: self.disk.min(limit.disk),
            gpus: self.gpus.min(limit.gpus),
            gpu_mem: self.gpu_mem.min(limit.gpu_mem),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpus:{} ram:{} disk:{} gpus:{} gpu_mem:{}",
            self.cpus,
            format_bytes(self.ram),
            format_bytes(self.disk),
            self.gpus,
            format_bytes(self.gpu_mem)
        )
    }
}

const KIB: u64 = 1024;
const KB: u64 = 1000;

/// Parse a human byte quantity as experiments declare them: a bare number,
/// or a number with a binary ("16gib") or decimal ("16gb") suffix. Case
/// and a trailing "b" are insignificant, so "16g", "16G", "16gb" agree.
pub fn parse_bytes(text: &str) -> RunnerResult<u64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RunnerError::InvalidArgument(
            "empty byte quantity".to_string(),
        ));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let value: f64 = digits.parse().map_err(|_| {
        RunnerError::InvalidArgument(format!("malformed byte quantity {trimmed:?}"))
    })?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => KB,
        "ki" | "kib" => KIB,
        "m" | "mb" => KB * KB,
        "mi" | "mib" => KIB * KIB,
        "g" | "gb" => KB * KB * KB,
        "gi" | "gib" => KIB * KIB * KIB,
        "t" | "tb" => KB * KB * KB * KB,
        "ti" | "tib" => KIB * KIB * KIB * KIB,
        other => {
            return Err(RunnerError::InvalidArgument(format!(
                "unknown byte unit {other:?} in {trimmed:?}"
            )))
        }
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 {
        return Err(RunnerError::InvalidArgument(format!(
            "byte quantity {trimmed:?} is out of range"
        )));
    }
    Ok(bytes as u64)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= KIB as f64 && unit < UNITS.len() - 1 {
        value /= KIB as f64;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}
