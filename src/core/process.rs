//! Process isolation - the consumed interface to the subprocess supervisor
//!
//! The supervisor owns the OS process handles; the instance manager only
//! mirrors the pid and status it reports. Implementations live outside this
//! crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Lifecycle status reported by the supervisor for one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Stopped,
    /// The process exited abnormally
    Crashed,
    /// The supervisor itself failed to manage the process
    Error,
}

/// Resource limits applied to a supervised process
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    /// Whether the supervisor enforces the ceilings below
    pub enforce_limits: bool,
    /// Memory ceiling in megabytes (0 = unlimited)
    pub max_memory_mb: u64,
    /// CPU ceiling as a percentage (0 = unlimited)
    pub max_cpu_percent: u8,
    /// Wall-clock run timeout (zero = unlimited)
    pub run_timeout: Duration,
    /// How often the supervisor polls the process
    pub poll_interval: Duration,
    /// Restart the process automatically after a crash
    pub auto_restart: bool,
    /// Maximum automatic restart attempts
    pub max_restarts: u32,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            enforce_limits: false,
            max_memory_mb: 0,
            max_cpu_percent: 0,
            run_timeout: Duration::ZERO,
            poll_interval: Duration::from_secs(5),
            auto_restart: false,
            max_restarts: 3,
        }
    }
}

/// Launch specification handed to the supervisor
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Instance ID, used as the supervisor-side key
    pub id: String,
    pub display_name: String,
    /// Executable to invoke
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Environment overlay applied on top of the parent environment
    pub environment: HashMap<String, String>,
    pub limits: ProcessLimits,
}

/// Point-in-time snapshot of a supervised process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub status: ProcessStatus,
    pub environment: HashMap<String, String>,
}

/// Supervisor contract: one isolated OS subprocess per instance
///
/// All methods are keyed by instance ID. Calls are expected to be bounded by
/// the supervisor's own internal timeouts; this crate imposes none.
pub trait ProcessIsolationManager: Send + Sync {
    /// Register a process record for later starting
    fn create_isolated_process(&self, spec: ProcessSpec) -> Result<()>;

    /// Spawn the registered process
    fn start_process(&self, id: &str) -> Result<()>;

    /// Terminate the process
    fn stop_process(&self, id: &str) -> Result<()>;

    /// Terminate and respawn the process
    fn restart_process(&self, id: &str) -> Result<()>;

    /// Report the current pid and status
    fn get_process(&self, id: &str) -> Result<ProcessInfo>;

    /// Remove the process record entirely
    fn delete_process(&self, id: &str) -> Result<()>;

    /// Shut the supervisor down, terminating everything it manages
    fn stop(&self) -> Result<()>;
}
