//! Instance manager - registry, lifecycle orchestration, and reconciliation
//!
//! Owns the in-memory instance registry, composes the process supervisor and
//! the database isolation manager, persists instance metadata to disk, and
//! runs a background loop that mirrors true process state into the registry.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::db::DatabaseIsolationManager;
use crate::error::{Error, Result};
use crate::persistence::{self, RegistryEntry};

use super::instance::{instance_id, Instance, InstanceConfig, InstanceStats, InstanceStatus};
use super::monitor::ResourceMonitor;
use super::process::{ProcessIsolationManager, ProcessSpec, ProcessStatus};
use super::settings::FleetSettings;

/// Subcommand the spawned worker runs under
const WORKER_SUBCOMMAND: &str = "serve";

/// How long deletion waits for a stopped worker to settle
const STOP_SETTLE_WAIT: Duration = Duration::from_millis(500);

type InstanceHandle = Arc<RwLock<Instance>>;

struct Reconciler {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Registry and lifecycle orchestrator for the instance fleet
pub struct InstanceManager {
    settings: FleetSettings,
    /// Executable re-invoked for each worker
    executable: PathBuf,
    instances: RwLock<HashMap<String, InstanceHandle>>,
    processes: Arc<dyn ProcessIsolationManager>,
    databases: Arc<DatabaseIsolationManager>,
    monitor: Mutex<ResourceMonitor>,
    reconciler: Mutex<Option<Reconciler>>,
}

impl InstanceManager {
    /// Build the manager, reload persisted instances, and start the
    /// reconciliation loop
    pub fn new(
        settings: FleetSettings,
        processes: Arc<dyn ProcessIsolationManager>,
        databases: Arc<DatabaseIsolationManager>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&settings.base_dir).map_err(Error::persistence)?;
        let executable = std::env::current_exe().map_err(Error::persistence)?;

        let instances = Self::reload(&settings)?;
        info!(
            count = instances.len(),
            base_dir = %settings.base_dir.display(),
            "instance registry loaded"
        );

        let manager = Arc::new(Self {
            settings,
            executable,
            instances: RwLock::new(instances),
            processes,
            databases,
            monitor: Mutex::new(ResourceMonitor::new()),
            reconciler: Mutex::new(None),
        });
        manager.spawn_reconciler()?;
        Ok(manager)
    }

    /// Rebuild registry entries from the registry file and per-instance
    /// config files; instances come back stopped
    fn reload(settings: &FleetSettings) -> Result<HashMap<String, InstanceHandle>> {
        let entries = persistence::load_registry(&settings.registry_path())?;
        let mut instances = HashMap::with_capacity(entries.len());
        for (id, entry) in entries {
            let config = match persistence::load_config(&entry.config_path) {
                Ok(config) => config,
                Err(err) => {
                    error!(instance = %id, "skipping instance with unreadable config: {err}");
                    continue;
                }
            };
            let mut instance = Instance::new(
                entry.id,
                entry.name,
                entry.phone,
                config,
                entry.working_dir,
                entry.config_path,
                entry.log_path,
                entry.created_at,
            );
            instance.port = entry.port;
            instance.metadata = entry.metadata;
            instances.insert(id, Arc::new(RwLock::new(instance)));
        }
        Ok(instances)
    }

    // === Lifecycle operations ===

    /// Create a new instance: allocate an ID and port, build the directory
    /// tree, provision isolated storage, and persist
    ///
    /// A mid-sequence failure aborts the call without compensating cleanup
    /// of resources already created.
    pub fn create_instance(
        &self,
        name: &str,
        phone: &str,
        mut config: InstanceConfig,
    ) -> Result<Instance> {
        let created_at = Utc::now();
        let id = instance_id(name, created_at);

        let mut registry = self
            .instances
            .write()
            .map_err(|_| Error::poisoned("instance registry"))?;
        if registry.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("instance {id}")));
        }

        let claimed = claimed_ports(&registry);
        if config.port == 0 {
            config.port = next_free_port(self.settings.base_port, &claimed)
                .ok_or_else(|| Error::Internal("no free port above base port".to_string()))?;
        } else if claimed.contains(&config.port) {
            return Err(Error::AlreadyExists(format!("port {}", config.port)));
        }

        let dir = self.settings.instance_dir(&id);
        for sub in [
            "storages",
            "statics/qrcode",
            "statics/senditems",
            "statics/media",
            "logs",
        ] {
            fs::create_dir_all(dir.join(sub)).map_err(Error::provisioning)?;
        }

        let database = self.databases.create_isolated_database(&id)?;
        if config.db_uri.is_empty() {
            config.db_uri = database.primary_uri.clone();
        }
        if config.keys_db_uri.is_empty() {
            config.keys_db_uri = database.keys_uri.clone();
        }

        let config_path = dir.join("config.json");
        let log_path = dir.join("logs").join("instance.log");
        let instance = Instance::new(
            id.clone(),
            name.to_string(),
            phone.to_string(),
            config,
            dir,
            config_path,
            log_path,
            created_at,
        );

        persistence::save_config(&instance.config_path, &instance.config)?;
        registry.insert(id.clone(), Arc::new(RwLock::new(instance.clone())));
        Self::persist_registry(&self.settings, &registry)?;

        info!(instance = %id, port = instance.port, "instance created");
        Ok(instance)
    }

    /// Start the instance's worker process
    pub fn start_instance(&self, id: &str) -> Result<()> {
        let handle = self.instance_handle(id)?;
        let mut instance = handle
            .write()
            .map_err(|_| Error::poisoned("instance"))?;

        if instance.status == InstanceStatus::Running {
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        instance.status = InstanceStatus::Starting;

        let spec = self.launch_spec(&instance);
        let launched = self
            .processes
            .create_isolated_process(spec)
            .and_then(|()| self.processes.start_process(id));
        if let Err(err) = launched {
            instance.mark_error();
            return Err(err);
        }

        match self.processes.get_process(id) {
            Ok(info) => {
                instance.mark_running(info.pid);
                info!(instance = %id, pid = info.pid, "instance started");
                Ok(())
            }
            Err(err) => {
                instance.mark_error();
                Err(err)
            }
        }
    }

    /// Stop the instance's worker process
    ///
    /// The instance is marked stopped even if the supervisor reports an
    /// error; stop is best-effort cleanup.
    pub fn stop_instance(&self, id: &str) -> Result<()> {
        let handle = self.instance_handle(id)?;
        let mut instance = handle
            .write()
            .map_err(|_| Error::poisoned("instance"))?;

        if !instance.status.is_active() {
            return Err(Error::NotRunning(id.to_string()));
        }
        instance.status = InstanceStatus::Stopping;

        if let Err(err) = self.processes.stop_process(id) {
            warn!(instance = %id, "supervisor stop failed, marking stopped anyway: {err}");
        }
        instance.mark_stopped();
        info!(instance = %id, "instance stopped");
        Ok(())
    }

    /// Restart the instance's worker process
    pub fn restart_instance(&self, id: &str) -> Result<()> {
        let handle = self.instance_handle(id)?;
        let mut instance = handle
            .write()
            .map_err(|_| Error::poisoned("instance"))?;

        instance.status = InstanceStatus::Restarting;
        self.processes.restart_process(id)?;

        let info = self.processes.get_process(id)?;
        instance.mark_running(info.pid);
        info!(instance = %id, pid = info.pid, "instance restarted");
        Ok(())
    }

    /// Delete the instance: stop it, tear down its process record, storage,
    /// and directory tree, and drop it from the registry
    ///
    /// Teardown sub-steps are best-effort; once the instance is known,
    /// deletion succeeds from the caller's perspective.
    pub fn delete_instance(&self, id: &str) -> Result<()> {
        let handle = self.instance_handle(id)?;
        {
            let mut instance = handle
                .write()
                .map_err(|_| Error::poisoned("instance"))?;
            if instance.status.is_active() {
                instance.status = InstanceStatus::Stopping;
                if let Err(err) = self.processes.stop_process(id) {
                    warn!(instance = %id, "stop during deletion failed: {err}");
                }
                instance.mark_stopped();
                // Give the worker a moment to release its files and port.
                thread::sleep(STOP_SETTLE_WAIT);
            }
        }

        if let Err(err) = self.processes.delete_process(id) {
            warn!(instance = %id, "process record removal failed: {err}");
        }
        if let Err(err) = self.databases.delete_isolated_database(id) {
            warn!(instance = %id, "database teardown failed: {err}");
        }
        let dir = self.settings.instance_dir(id);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(instance = %id, dir = %dir.display(), "directory removal failed: {err}");
            }
        }

        let mut registry = self
            .instances
            .write()
            .map_err(|_| Error::poisoned("instance registry"))?;
        registry.remove(id);
        if let Err(err) = Self::persist_registry(&self.settings, &registry) {
            warn!(instance = %id, "registry persist after deletion failed: {err}");
        }

        info!(instance = %id, "instance deleted");
        Ok(())
    }

    // === Reads ===

    /// Snapshot of one instance
    pub fn get_instance(&self, id: &str) -> Result<Instance> {
        let handle = self.instance_handle(id)?;
        let instance = handle.read().map_err(|_| Error::poisoned("instance"))?;
        Ok(instance.clone())
    }

    /// Snapshots of every instance
    pub fn list_instances(&self) -> Vec<Instance> {
        let registry = match self.instances.read() {
            Ok(registry) => registry,
            Err(_) => return Vec::new(),
        };
        registry
            .values()
            .filter_map(|handle| handle.read().ok().map(|i| i.clone()))
            .collect()
    }

    /// Per-status counts and best-effort resource usage for running workers
    pub fn get_stats(&self) -> InstanceStats {
        let snapshot = self.list_instances();
        let mut stats = InstanceStats {
            total: snapshot.len(),
            ..Default::default()
        };

        let mut monitor = match self.monitor.lock() {
            Ok(monitor) => monitor,
            Err(_) => return stats,
        };
        monitor.refresh();

        for instance in &snapshot {
            *stats
                .by_status
                .entry(instance.status.label().to_string())
                .or_insert(0) += 1;
            if instance.status == InstanceStatus::Running && instance.pid != 0 {
                // Zero-filled when the OS cannot be sampled, not an error.
                let usage = monitor.usage(instance.pid).unwrap_or_default();
                stats.usage.insert(instance.id.clone(), usage);
            }
        }
        stats
    }

    // === Reconciliation ===

    /// One reconciliation pass: mirror the supervisor's view of every
    /// running instance into the registry
    ///
    /// This is the only writer that moves an instance out of `Running`
    /// without an explicit API call; it models asynchronous process death.
    pub fn reconcile_once(&self) {
        let handles: Vec<(String, InstanceHandle)> = match self.instances.read() {
            Ok(registry) => registry
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect(),
            Err(_) => return,
        };

        for (id, handle) in handles {
            let Ok(mut instance) = handle.write() else {
                continue;
            };
            if instance.status != InstanceStatus::Running {
                continue;
            }

            match self.processes.get_process(&id) {
                Ok(info) => match info.status {
                    ProcessStatus::Running => {
                        instance.pid = info.pid;
                        instance.touch();
                    }
                    ProcessStatus::Stopped => {
                        info!(instance = %id, "worker exited, marking stopped");
                        instance.mark_stopped();
                    }
                    ProcessStatus::Crashed | ProcessStatus::Error => {
                        warn!(instance = %id, "worker died, marking error");
                        instance.mark_error();
                    }
                },
                Err(err) => {
                    warn!(instance = %id, "supervisor has no record, marking error: {err}");
                    instance.mark_error();
                }
            }
        }
    }

    fn spawn_reconciler(self: &Arc<Self>) -> Result<()> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.settings.reconcile_interval;

        let thread = thread::Builder::new()
            .name("fleet-reconciler".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.reconcile_once();
                    }
                    // Explicit stop or manager dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|err| Error::Internal(format!("failed to spawn reconciler: {err}")))?;

        let mut slot = self
            .reconciler
            .lock()
            .map_err(|_| Error::poisoned("reconciler"))?;
        *slot = Some(Reconciler { stop_tx, thread });
        debug!(interval = ?interval, "reconciliation loop started");
        Ok(())
    }

    /// Shut the manager down: cancel reconciliation, best-effort stop every
    /// active instance, then stop both collaborator managers
    pub fn stop(&self) {
        if let Ok(mut slot) = self.reconciler.lock() {
            if let Some(reconciler) = slot.take() {
                let _ = reconciler.stop_tx.send(());
                let _ = reconciler.thread.join();
            }
        }

        for instance in self.list_instances() {
            if instance.status.is_active() {
                if let Err(err) = self.stop_instance(&instance.id) {
                    warn!(instance = %instance.id, "stop during shutdown failed: {err}");
                }
            }
        }

        if let Err(err) = self.processes.stop() {
            warn!("supervisor shutdown failed: {err}");
        }
        self.databases.stop();
        info!("instance manager stopped");
    }

    // === Internals ===

    fn instance_handle(&self, id: &str) -> Result<InstanceHandle> {
        let registry = self
            .instances
            .read()
            .map_err(|_| Error::poisoned("instance registry"))?;
        registry
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    fn persist_registry(
        settings: &FleetSettings,
        registry: &HashMap<String, InstanceHandle>,
    ) -> Result<()> {
        let mut entries = HashMap::with_capacity(registry.len());
        for (id, handle) in registry {
            let instance = handle.read().map_err(|_| Error::poisoned("instance"))?;
            entries.insert(id.clone(), RegistryEntry::from(&*instance));
        }
        persistence::save_registry(&settings.registry_path(), &entries)
    }

    /// Launch specification for the instance's worker: re-invoke this
    /// executable with the serve subcommand and flags from the stored config
    fn launch_spec(&self, instance: &Instance) -> ProcessSpec {
        let config = &instance.config;
        let mut args = vec![
            WORKER_SUBCOMMAND.to_string(),
            "--port".to_string(),
            instance.port.to_string(),
            "--platform".to_string(),
            config.platform.clone(),
            "--db-uri".to_string(),
            config.db_uri.clone(),
            "--keys-db-uri".to_string(),
            config.keys_db_uri.clone(),
        ];
        if config.debug {
            args.push("--debug".to_string());
        }
        if !config.base_path.is_empty() {
            args.push("--base-path".to_string());
            args.push(config.base_path.clone());
        }
        for credential in &config.credentials {
            args.push("--auth".to_string());
            args.push(credential.clone());
        }
        if !config.auto_reply.is_empty() {
            args.push("--autoreply".to_string());
            args.push(config.auto_reply.clone());
        }
        if config.auto_mark_read {
            args.push("--auto-mark-read".to_string());
        }
        for webhook in &config.webhooks {
            args.push("--webhook".to_string());
            args.push(webhook.clone());
        }
        if !config.webhook_secret.is_empty() {
            args.push("--webhook-secret".to_string());
            args.push(config.webhook_secret.clone());
        }
        args.push(format!("--account-validation={}", config.account_validation));

        let mut environment = HashMap::new();
        environment.insert("GATEWAY_INSTANCE_ID".to_string(), instance.id.clone());
        environment.insert("GATEWAY_INSTANCE_NAME".to_string(), instance.name.clone());
        environment.insert("GATEWAY_PHONE".to_string(), instance.phone.clone());
        environment.insert(
            "GATEWAY_STORAGE_PATH".to_string(),
            instance.working_dir.join("storages").display().to_string(),
        );
        environment.insert(
            "GATEWAY_STATIC_PATH".to_string(),
            instance.working_dir.join("statics").display().to_string(),
        );
        environment.insert(
            "GATEWAY_LOG_PATH".to_string(),
            instance.working_dir.join("logs").display().to_string(),
        );
        environment.extend(
            config
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        ProcessSpec {
            id: instance.id.clone(),
            display_name: instance.name.clone(),
            executable: self.executable.clone(),
            args,
            environment,
            limits: self.settings.limits.clone(),
        }
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        // Unblock the reconciler thread; join is not safe in drop.
        if let Ok(mut slot) = self.reconciler.lock() {
            if let Some(reconciler) = slot.take() {
                let _ = reconciler.stop_tx.send(());
            }
        }
    }
}

fn claimed_ports(registry: &HashMap<String, InstanceHandle>) -> HashSet<u16> {
    registry
        .values()
        .filter_map(|handle| handle.read().ok().map(|i| i.port))
        .collect()
}

/// Scan ascending from `base` for a port no live registry entry claims;
/// `None` once the range is exhausted
fn next_free_port(base: u16, claimed: &HashSet<u16>) -> Option<u16> {
    (base..=u16::MAX).find(|port| !claimed.contains(port))
}
