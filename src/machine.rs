//! Live machine inventory
//!
//! The capacity check in admission compares a queue's resource hint with
//! what the host has free right now. Sampling hides behind
//! [`MachineInventory`] so tests inject fixed values; the production
//! implementation reads CPU, memory, and disk state through `sysinfo` and
//! asks a [`GpuProbe`] for the largest single board's free capacity.
//! Board-level GPU accounting is deliberate: a job asking for four GPUs
//! must find four on one board, not two on each of two boards.

use crate::config::Limits;
use crate::resource::Resource;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Disks, System};

/// Source of the host's currently free resources.
pub trait MachineInventory: Send + Sync {
    fn free(&self) -> Resource;
}

/// Free capacity of a single GPU board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuCapacity {
    pub slots: u32,
    pub mem: u64,
}

/// Reports the largest single board's free slots and free VRAM.
///
/// The CUDA-backed probe lives outside this crate; [`NoGpus`] stands in
/// on hosts without boards.
pub trait GpuProbe: Send + Sync {
    fn largest_board(&self) -> GpuCapacity;
}

/// Probe for GPU-less hosts.
#[derive(Debug, Default)]
pub struct NoGpus;

impl GpuProbe for NoGpus {
    fn largest_board(&self) -> GpuCapacity {
        GpuCapacity::default()
    }
}

/// `sysinfo`-backed inventory clamped by the operator limits.
pub struct SysInventory {
    limits: Limits,
    workdir: PathBuf,
    gpus: Arc<dyn GpuProbe>,
    system: Mutex<System>,
}

impl SysInventory {
    /// `workdir` selects the filesystem whose free space counts as free
    /// disk; experiments unpack and run beneath it.
    pub fn new(limits: Limits, workdir: impl Into<PathBuf>, gpus: Arc<dyn GpuProbe>) -> Self {
        Self {
            limits,
            workdir: workdir.into(),
            gpus,
            system: Mutex::new(System::new()),
        }
    }

    fn free_cpus(system: &System) -> u32 {
        let total = num_cpus::get() as f32;
        let busy = system.global_cpu_info().cpu_usage() / 100.0;
        (total * (1.0 - busy.clamp(0.0, 1.0))).floor() as u32
    }

    fn free_disk(workdir: &Path) -> u64 {
        let disks = Disks::new_with_refreshed_list();
        // Longest mount-point prefix of the working directory wins.
        disks
            .iter()
            .filter(|disk| workdir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .unwrap_or(0)
    }
}

impl MachineInventory for SysInventory {
    fn free(&self) -> Resource {
        let (cpus, ram) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (Self::free_cpus(&system), system.available_memory())
        };
        let board = self.gpus.largest_board();

        let sampled = Resource {
            cpus,
            ram,
            disk: Self::free_disk(&self.workdir),
            gpus: board.slots,
            gpu_mem: board.mem,
        };
        sampled.clamp_to(&self.limits.as_resource())
    }
}

/// Inventory returning a constant value, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedInventory(pub Resource);

impl MachineInventory for FixedInventory {
    fn free(&self) -> Resource {
        self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sys_inventory_respects_limits() {
        let limits = Limits {
            max_cpus: 1,
            max_ram: 1,
            max_disk: 1,
        };
        let inventory = SysInventory::new(limits, "/", Arc::new(NoGpus));
        let free = inventory.free();
        assert!(free.cpus <= 1);
        assert!(free.ram <= 1);
        assert!(free.disk <= 1);
        assert_eq!(free.gpus, 0);
        assert_eq!(free.gpu_mem, 0);
    }

    #[test]
    fn fixed_inventory_returns_value() {
        let fixed = FixedInventory(Resource {
            cpus: 4,
            ..Resource::default()
        });
        assert_eq!(fixed.free().cpus, 4);
    }
}
