//! Integration tests for the instance manager lifecycle
//!
//! The subprocess supervisor is replaced by an in-memory fake so process
//! death and supervisor failures can be scripted deterministically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetgate::core::process::{
    ProcessInfo, ProcessIsolationManager, ProcessSpec, ProcessStatus,
};
use fleetgate::{
    DatabaseIsolationManager, Error, FleetSettings, InstanceConfig, InstanceManager,
    InstanceStatus,
};

/// In-memory supervisor fake
#[derive(Default)]
struct FakeSupervisor {
    procs: Mutex<HashMap<String, ProcessInfo>>,
    next_pid: AtomicU32,
    fail_delete: AtomicBool,
    fail_start: AtomicBool,
}

impl FakeSupervisor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(4000),
            ..Default::default()
        })
    }

    fn set_status(&self, id: &str, status: ProcessStatus) {
        let mut procs = self.procs.lock().unwrap();
        if let Some(info) = procs.get_mut(id) {
            info.status = status;
        }
    }

    fn forget(&self, id: &str) {
        self.procs.lock().unwrap().remove(id);
    }
}

impl ProcessIsolationManager for FakeSupervisor {
    fn create_isolated_process(&self, spec: ProcessSpec) -> fleetgate::Result<()> {
        self.procs.lock().unwrap().insert(
            spec.id.clone(),
            ProcessInfo {
                pid: 0,
                status: ProcessStatus::Stopped,
                environment: spec.environment,
            },
        );
        Ok(())
    }

    fn start_process(&self, id: &str) -> fleetgate::Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Process("scripted start failure".to_string()));
        }
        let mut procs = self.procs.lock().unwrap();
        let info = procs
            .get_mut(id)
            .ok_or_else(|| Error::Process(format!("no record for {id}")))?;
        info.pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        info.status = ProcessStatus::Running;
        Ok(())
    }

    fn stop_process(&self, id: &str) -> fleetgate::Result<()> {
        let mut procs = self.procs.lock().unwrap();
        let info = procs
            .get_mut(id)
            .ok_or_else(|| Error::Process(format!("no record for {id}")))?;
        info.pid = 0;
        info.status = ProcessStatus::Stopped;
        Ok(())
    }

    fn restart_process(&self, id: &str) -> fleetgate::Result<()> {
        self.stop_process(id)?;
        self.start_process(id)
    }

    fn get_process(&self, id: &str) -> fleetgate::Result<ProcessInfo> {
        self.procs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Process(format!("no record for {id}")))
    }

    fn delete_process(&self, id: &str) -> fleetgate::Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Process("scripted delete failure".to_string()));
        }
        self.procs.lock().unwrap().remove(id);
        Ok(())
    }

    fn stop(&self) -> fleetgate::Result<()> {
        self.procs.lock().unwrap().clear();
        Ok(())
    }
}

/// Route test logs through the usual filter; repeat calls are no-ops
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings(root: &Path) -> FleetSettings {
    FleetSettings {
        base_port: 19000,
        // Keep the timer out of the way; tests drive reconciliation directly.
        reconcile_interval: Duration::from_secs(3600),
        ..FleetSettings::with_base_dir(root.join("fleet"))
    }
}

fn new_manager(root: &Path) -> (Arc<InstanceManager>, Arc<FakeSupervisor>) {
    init_logging();
    let supervisor = FakeSupervisor::new();
    let databases = Arc::new(DatabaseIsolationManager::sqlite(root.join("db")));
    let manager = InstanceManager::new(settings(root), supervisor.clone(), databases)
        .expect("manager should build");
    (manager, supervisor)
}

#[test]
fn distinct_names_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let a = manager
        .create_instance("Alice", "+15550001", InstanceConfig::default())
        .unwrap();
    let b = manager
        .create_instance("Bob", "+15550002", InstanceConfig::default())
        .unwrap();
    assert_ne!(a.id, b.id);

    manager.stop();
}

#[test]
fn port_zero_is_auto_assigned_without_collision() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let a = manager
        .create_instance("a", "+1", InstanceConfig::default())
        .unwrap();
    let b = manager
        .create_instance("b", "+2", InstanceConfig::default())
        .unwrap();
    assert_eq!(a.port, 19000);
    assert_eq!(b.port, 19001);
    assert_ne!(a.port, b.port);

    manager.stop();
}

#[test]
fn explicit_duplicate_port_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    manager
        .create_instance(
            "a",
            "+1",
            InstanceConfig {
                port: 19100,
                ..Default::default()
            },
        )
        .unwrap();
    let err = manager
        .create_instance(
            "b",
            "+2",
            InstanceConfig {
                port: 19100,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    manager.stop();
}

#[test]
fn start_twice_fails_and_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&inst.id).unwrap();
    let running = manager.get_instance(&inst.id).unwrap();
    assert_eq!(running.status, InstanceStatus::Running);
    assert_ne!(running.pid, 0);

    let err = manager.start_instance(&inst.id).unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning(_)));
    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Running);
    assert_eq!(after.pid, running.pid);

    manager.stop();
}

#[test]
fn stop_when_stopped_fails_and_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    let err = manager.stop_instance(&inst.id).unwrap_err();
    assert!(matches!(err, Error::NotRunning(_)));
    assert_eq!(
        manager.get_instance(&inst.id).unwrap().status,
        InstanceStatus::Stopped
    );

    manager.stop();
}

#[test]
fn failed_start_marks_error() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    supervisor.fail_start.store(true, Ordering::SeqCst);

    let err = manager.start_instance(&inst.id).unwrap_err();
    assert!(matches!(err, Error::Process(_)));
    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Error);
    assert_eq!(after.pid, 0);

    manager.stop();
}

#[test]
fn restart_replaces_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&inst.id).unwrap();
    let first = manager.get_instance(&inst.id).unwrap().pid;

    manager.restart_instance(&inst.id).unwrap();
    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Running);
    assert_ne!(after.pid, 0);
    assert_ne!(after.pid, first);

    manager.stop();
}

#[test]
fn delete_unknown_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let err = manager.delete_instance("no-such-1").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    manager.stop();
}

#[test]
fn delete_succeeds_even_when_teardown_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&inst.id).unwrap();
    supervisor.fail_delete.store(true, Ordering::SeqCst);

    manager.delete_instance(&inst.id).unwrap();
    assert!(manager.list_instances().is_empty());
    assert!(matches!(
        manager.get_instance(&inst.id),
        Err(Error::NotFound(_))
    ));

    manager.stop();
}

#[test]
fn crash_is_reconciled_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let inst = manager
        .create_instance("Alice", "+15550001", InstanceConfig::default())
        .unwrap();
    assert_eq!(inst.status, InstanceStatus::Stopped);

    manager.start_instance(&inst.id).unwrap();
    let running = manager.get_instance(&inst.id).unwrap();
    assert_eq!(running.status, InstanceStatus::Running);
    assert_ne!(running.pid, 0);

    supervisor.set_status(&inst.id, ProcessStatus::Crashed);
    manager.reconcile_once();

    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Error);
    assert_eq!(after.pid, 0);

    manager.stop();
}

#[test]
fn clean_exit_is_reconciled_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&inst.id).unwrap();

    supervisor.set_status(&inst.id, ProcessStatus::Stopped);
    manager.reconcile_once();

    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Stopped);
    assert_eq!(after.pid, 0);

    manager.stop();
}

#[test]
fn lost_supervisor_record_is_reconciled_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&inst.id).unwrap();
    supervisor.forget(&inst.id);

    manager.reconcile_once();
    let after = manager.get_instance(&inst.id).unwrap();
    assert_eq!(after.status, InstanceStatus::Error);
    assert_eq!(after.pid, 0);

    manager.stop();
}

#[test]
fn reconcile_ignores_stopped_instances() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let inst = manager
        .create_instance("alice", "+1", InstanceConfig::default())
        .unwrap();
    manager.reconcile_once();
    assert_eq!(
        manager.get_instance(&inst.id).unwrap().status,
        InstanceStatus::Stopped
    );

    manager.stop();
}

#[test]
fn end_to_end_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    init_logging();
    let supervisor = FakeSupervisor::new();
    let databases = Arc::new(DatabaseIsolationManager::sqlite(dir.path().join("db")));
    let manager = InstanceManager::new(
        settings(dir.path()),
        supervisor.clone(),
        databases.clone(),
    )
    .unwrap();

    // Create: registry entry plus provisioned database record.
    let inst = manager
        .create_instance("Alice", "+15550001", InstanceConfig::default())
        .unwrap();
    assert_eq!(inst.status, InstanceStatus::Stopped);
    assert!(databases.get_isolated_database(&inst.id).is_ok());
    assert!(!inst.config.db_uri.is_empty());
    assert!(!inst.config.keys_db_uri.is_empty());
    assert!(inst.working_dir.join("storages").is_dir());
    assert!(inst.working_dir.join("statics/qrcode").is_dir());
    assert!(inst.working_dir.join("statics/senditems").is_dir());
    assert!(inst.working_dir.join("statics/media").is_dir());
    assert!(inst.working_dir.join("logs").is_dir());

    // Start.
    manager.start_instance(&inst.id).unwrap();
    let running = manager.get_instance(&inst.id).unwrap();
    assert_eq!(running.status, InstanceStatus::Running);
    assert_ne!(running.pid, 0);

    // Simulated process death, then one reconciliation cycle.
    supervisor.set_status(&inst.id, ProcessStatus::Crashed);
    manager.reconcile_once();
    let crashed = manager.get_instance(&inst.id).unwrap();
    assert_eq!(crashed.status, InstanceStatus::Error);
    assert_eq!(crashed.pid, 0);

    // Delete: gone from both registries.
    manager.delete_instance(&inst.id).unwrap();
    assert!(manager.list_instances().is_empty());
    assert!(matches!(
        databases.get_isolated_database(&inst.id),
        Err(Error::NotFound(_))
    ));
    assert!(!inst.working_dir.exists());

    manager.stop();
}

#[test]
fn worker_launch_spec_carries_instance_environment() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, supervisor) = new_manager(dir.path());

    let mut config = InstanceConfig::default();
    config
        .environment
        .insert("EXTRA_FLAG".to_string(), "1".to_string());
    let inst = manager.create_instance("alice", "+1", config).unwrap();
    manager.start_instance(&inst.id).unwrap();

    let info = supervisor.get_process(&inst.id).unwrap();
    assert_eq!(
        info.environment.get("GATEWAY_INSTANCE_ID").map(String::as_str),
        Some(inst.id.as_str())
    );
    assert_eq!(
        info.environment.get("GATEWAY_PHONE").map(String::as_str),
        Some("+1")
    );
    assert!(info.environment.contains_key("GATEWAY_STORAGE_PATH"));
    assert!(info.environment.contains_key("GATEWAY_STATIC_PATH"));
    assert!(info.environment.contains_key("GATEWAY_LOG_PATH"));
    assert_eq!(
        info.environment.get("EXTRA_FLAG").map(String::as_str),
        Some("1")
    );

    manager.stop();
}

#[test]
fn stats_count_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = new_manager(dir.path());

    let a = manager
        .create_instance("a", "+1", InstanceConfig::default())
        .unwrap();
    let b = manager
        .create_instance("b", "+2", InstanceConfig::default())
        .unwrap();
    manager.start_instance(&a.id).unwrap();

    let stats = manager.get_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_status.get("Running").copied(), Some(1));
    assert_eq!(stats.by_status.get("Stopped").copied(), Some(1));
    // Usage is present for the running instance even though the fake
    // supervisor's pid is not a real worker; readings are best-effort.
    assert!(stats.usage.contains_key(&a.id));
    assert!(!stats.usage.contains_key(&b.id));

    manager.stop();
}

#[test]
fn registry_survives_manager_restart() {
    let dir = tempfile::tempdir().unwrap();

    let created = {
        let (manager, _) = new_manager(dir.path());
        let inst = manager
            .create_instance("Alice", "+15550001", InstanceConfig::default())
            .unwrap();
        manager.stop();
        inst
    };

    let (manager, _) = new_manager(dir.path());
    let reloaded = manager.get_instance(&created.id).unwrap();
    assert_eq!(reloaded.name, "Alice");
    assert_eq!(reloaded.phone, "+15550001");
    assert_eq!(reloaded.port, created.port);
    assert_eq!(reloaded.status, InstanceStatus::Stopped);
    assert_eq!(reloaded.pid, 0);
    assert_eq!(reloaded.config.db_uri, created.config.db_uri);

    manager.stop();
}
