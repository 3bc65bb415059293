//! Resource monitoring - best-effort CPU and memory sampling for workers

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::instance::ResourceUsage;

/// Samples per-process resource usage from the OS
///
/// Readings are best-effort: a pid that cannot be sampled yields zero-filled
/// usage rather than an error.
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refresh process tables before sampling
    pub fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
    }

    /// Sample one process, if the OS still knows it
    pub fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;
        Some(ResourceUsage {
            pid,
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
