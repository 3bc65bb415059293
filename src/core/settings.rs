//! Fleet settings - tunables for the instance manager

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::process::ProcessLimits;

/// First port probed when a config requests auto-assignment
pub const DEFAULT_BASE_PORT: u16 = 3000;

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Root directory under which each instance's tree is created
    pub base_dir: PathBuf,
    /// First port probed when `config.port == 0`
    pub base_port: u16,
    /// Interval between reconciliation passes
    pub reconcile_interval: Duration,
    /// Default resource limits for spawned workers
    #[serde(skip)]
    pub limits: ProcessLimits,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            base_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleetgate"),
            base_port: DEFAULT_BASE_PORT,
            reconcile_interval: Duration::from_secs(30),
            limits: ProcessLimits::default(),
        }
    }
}

impl FleetSettings {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Path of the flat registry file
    pub fn registry_path(&self) -> PathBuf {
        self.base_dir.join("registry.json")
    }

    /// Root directory of one instance's tree
    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }
}
