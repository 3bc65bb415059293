//! Database isolation - one exclusive storage pair per instance
//!
//! Every instance owns two storage units: a primary database and a
//! key-material database. The backend (embedded SQLite files or per-instance
//! databases on a shared PostgreSQL server) is fixed when the manager is
//! constructed and serves all instances for the manager's whole lifetime.

mod postgres;
mod sqlite;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

pub use self::postgres::replace_database_name;

/// Storage technology behind a database isolation manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Embedded SQLite files, one pair per instance
    Sqlite,
    /// Per-instance databases on a shared PostgreSQL server
    Postgres,
}

/// Storage provisioning record for one instance
///
/// Live connection handles are owned by the backend, not by this record;
/// copies of it are plain data and safe to hand out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedDatabase {
    pub instance_id: String,
    pub backend: BackendKind,
    /// Primary database file (embedded backend only)
    pub primary_path: Option<PathBuf>,
    /// Key-material database file (embedded backend only)
    pub keys_path: Option<PathBuf>,
    /// Generated primary database name (networked backend only)
    pub primary_db_name: Option<String>,
    /// Generated key-material database name (networked backend only)
    pub keys_db_name: Option<String>,
    /// Fully-qualified primary connection string
    pub primary_uri: String,
    /// Fully-qualified key-material connection string
    pub keys_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Backend contract shared by the embedded and networked implementations
pub(crate) trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the storage pair, open and ping both connections, and
    /// bootstrap the schema. Must leave nothing registered on failure.
    fn provision(&self, id: &str) -> Result<IsolatedDatabase>;

    /// Close any open connections for the instance
    fn close(&self, id: &str);

    /// Remove the underlying storage, best-effort: sub-step failures are
    /// logged, never surfaced
    fn destroy(&self, db: &IsolatedDatabase);

    /// File-level copy of the storage pair into `dest`
    fn backup(&self, db: &IsolatedDatabase, dest: &Path) -> Result<()>;

    /// Replace the storage pair from `src`, reopen, and re-bootstrap
    fn restore(&self, db: &IsolatedDatabase, src: &Path) -> Result<()>;

    /// Close every open connection across every instance
    fn close_all(&self);
}

/// Provisions and destroys isolated storage per instance
pub struct DatabaseIsolationManager {
    backend: Box<dyn IsolationBackend>,
    databases: RwLock<HashMap<String, IsolatedDatabase>>,
}

impl DatabaseIsolationManager {
    /// Manager over the embedded-file backend rooted at `base_dir`
    pub fn sqlite(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Box::new(sqlite::SqliteBackend::new(base_dir.into())),
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Manager over the networked-relational backend
    ///
    /// `base_uri` is the shared server connection string; per-instance
    /// database names are substituted into its database-name segment.
    pub fn postgres(base_uri: impl Into<String>) -> Self {
        Self {
            backend: Box::new(postgres::PostgresBackend::new(base_uri.into())),
            databases: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Provision the storage pair for a new instance and bootstrap its schema
    pub fn create_isolated_database(&self, id: &str) -> Result<IsolatedDatabase> {
        let mut databases = self
            .databases
            .write()
            .map_err(|_| Error::poisoned("database registry"))?;
        if databases.contains_key(id) {
            return Err(Error::AlreadyExists(format!(
                "isolated database for instance {id}"
            )));
        }

        let record = self.backend.provision(id)?;
        databases.insert(id.to_string(), record.clone());
        info!(instance = id, backend = ?record.backend, "isolated database provisioned");
        Ok(record)
    }

    /// Snapshot of one provisioning record
    pub fn get_isolated_database(&self, id: &str) -> Result<IsolatedDatabase> {
        let databases = self
            .databases
            .read()
            .map_err(|_| Error::poisoned("database registry"))?;
        databases
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("isolated database for instance {id}")))
    }

    /// Snapshots of every provisioning record
    pub fn list_databases(&self) -> Vec<IsolatedDatabase> {
        self.databases
            .read()
            .map(|dbs| dbs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tear down the instance's storage
    ///
    /// Sub-step failures are logged and swallowed; the tracked record is
    /// removed regardless.
    pub fn delete_isolated_database(&self, id: &str) -> Result<()> {
        let record = {
            let mut databases = self
                .databases
                .write()
                .map_err(|_| Error::poisoned("database registry"))?;
            databases
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("isolated database for instance {id}")))?
        };

        self.backend.close(id);
        self.backend.destroy(&record);
        info!(instance = id, "isolated database deleted");
        Ok(())
    }

    /// Copy the instance's storage files into `dest`
    pub fn backup_database(&self, id: &str, dest: &Path) -> Result<()> {
        let record = self.get_isolated_database(id)?;
        self.backend.backup(&record, dest)?;
        info!(instance = id, dest = %dest.display(), "database backed up");
        Ok(())
    }

    /// Replace the instance's storage files from `src`
    pub fn restore_database(&self, id: &str, src: &Path) -> Result<()> {
        let record = self.get_isolated_database(id)?;
        self.backend.restore(&record, src)?;
        info!(instance = id, src = %src.display(), "database restored");
        Ok(())
    }

    /// Close every open connection; idempotent
    pub fn stop(&self) {
        self.backend.close_all();
    }
}

impl Drop for DatabaseIsolationManager {
    fn drop(&mut self) {
        self.backend.close_all();
    }
}
