//! Instance model - one isolated gateway worker and its configuration

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance exists but no process is running
    Stopped,
    /// A start request is in flight
    Starting,
    /// The worker process is alive
    Running,
    /// A stop request is in flight
    Stopping,
    /// A restart request is in flight
    Restarting,
    /// The worker died or a lifecycle operation failed
    Error,
}

impl InstanceStatus {
    /// Whether a worker process may be attached to this instance
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Restarting)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Restarting => "Restarting",
            Self::Error => "Error",
        }
    }
}

/// Launch-time configuration for a gateway instance
///
/// Produced by the caller at creation time, written verbatim to the
/// instance's config file, and read back unchanged when the manager reloads
/// its registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Network port the worker listens on (0 = auto-assign at creation)
    pub port: u16,
    /// Enable debug logging in the worker
    pub debug: bool,
    /// Device platform reported to the messaging service
    pub platform: String,
    /// Basic-auth credentials (`user:password` pairs) accepted by the worker
    pub credentials: Vec<String>,
    /// URL base-path prefix the worker serves under
    pub base_path: String,
    /// Primary storage connection string (filled from provisioning if empty)
    pub db_uri: String,
    /// Key-material storage connection string (filled from provisioning if empty)
    pub keys_db_uri: String,
    /// Auto-reply text sent for inbound messages (empty = disabled)
    pub auto_reply: String,
    /// Mark inbound messages as read automatically
    pub auto_mark_read: bool,
    /// Outbound webhook URLs
    pub webhooks: Vec<String>,
    /// Shared secret sent with webhook deliveries
    pub webhook_secret: String,
    /// Validate the account with the messaging service on connect
    pub account_validation: bool,
    /// Extra environment variables passed to the worker process
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            port: 0,
            debug: false,
            platform: "Chrome".to_string(),
            credentials: Vec::new(),
            base_path: String::new(),
            db_uri: String::new(),
            keys_db_uri: String::new(),
            auto_reply: String::new(),
            auto_mark_read: false,
            webhooks: Vec::new(),
            webhook_secret: String::new(),
            account_validation: true,
            environment: HashMap::new(),
        }
    }
}

/// One managed gateway worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier: sanitized name + creation timestamp
    pub id: String,
    /// Display name
    pub name: String,
    /// Contact identifier (phone number) bound to this instance
    pub phone: String,
    /// Network port the worker listens on
    pub port: u16,
    /// OS process ID of the worker, 0 when not running
    pub pid: u32,
    /// Root of the instance's directory tree
    pub working_dir: PathBuf,
    /// Path to the instance's config file
    pub config_path: PathBuf,
    /// Path to the instance's log file
    pub log_path: PathBuf,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When the worker was last started
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker was last observed alive
    pub last_seen: Option<DateTime<Utc>>,
    /// Current lifecycle status
    pub status: InstanceStatus,
    /// Configuration snapshot used to launch the worker
    pub config: InstanceConfig,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        phone: String,
        config: InstanceConfig,
        working_dir: PathBuf,
        config_path: PathBuf,
        log_path: PathBuf,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            phone,
            port: config.port,
            pid: 0,
            working_dir,
            config_path,
            log_path,
            created_at,
            started_at: None,
            last_seen: None,
            status: InstanceStatus::Stopped,
            config,
            metadata: HashMap::new(),
        }
    }

    /// Mark the instance as running with the given worker pid
    pub fn mark_running(&mut self, pid: u32) {
        self.status = InstanceStatus::Running;
        self.pid = pid;
        let now = Utc::now();
        self.started_at = Some(now);
        self.last_seen = Some(now);
    }

    /// Mark the instance as stopped and clear the mirrored pid
    pub fn mark_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.pid = 0;
    }

    /// Mark the instance as failed and clear the mirrored pid
    pub fn mark_error(&mut self) {
        self.status = InstanceStatus::Error;
        self.pid = 0;
    }

    /// Refresh the last-observed-alive stamp
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// Uptime since the last start, if any
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }
}

/// Derive an instance ID from a display name and creation time
///
/// The timestamp suffix has one-second resolution, so two creations of the
/// same name within the same second yield the same ID.
pub fn instance_id(name: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", sanitize_name(name), created_at.timestamp())
}

/// Reduce a display name to a filesystem- and identifier-safe token
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if matches!(c, ' ' | '-' | '_' | '.') && !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "instance".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Best-effort resource usage for one running worker
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    pub pid: u32,
    /// CPU usage percentage, 0.0 when OS metrics are unavailable
    pub cpu_percent: f32,
    /// Resident memory in bytes, 0 when OS metrics are unavailable
    pub memory_bytes: u64,
}

/// Aggregate snapshot over the whole registry, computed on demand
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    /// Total number of tracked instances
    pub total: usize,
    /// Instance counts keyed by status label
    pub by_status: HashMap<String, usize>,
    /// Resource usage keyed by instance ID, running instances only
    pub usage: HashMap<String, ResourceUsage>,
}
