//! Embedded-file backend - one pair of SQLite files per instance

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{BackendKind, IsolatedDatabase, IsolationBackend};

/// Primary database schema, SQLite column types
const PRIMARY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instance_info (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    session_data BLOB,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    body TEXT,
    timestamp INTEGER NOT NULL,
    is_from_me INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS contacts (
    jid TEXT PRIMARY KEY,
    name TEXT,
    notify TEXT,
    updated_at TEXT
);
"#;

/// Key-material database schema, SQLite column types
const KEYS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS encryption_keys (
    id TEXT PRIMARY KEY,
    key_data BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_keys (
    session_id TEXT PRIMARY KEY,
    key_data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

struct ConnectionPair {
    primary: Connection,
    keys: Connection,
}

/// SQLite implementation: `<base>/<id>/primary.db` + `<base>/<id>/keys.db`
pub(crate) struct SqliteBackend {
    base_dir: PathBuf,
    connections: Mutex<HashMap<String, ConnectionPair>>,
}

impl SqliteBackend {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// `file:` URI so the driver enforces referential integrity
    fn file_uri(path: &Path) -> String {
        format!("file:{}?_foreign_keys=on", path.display())
    }

    /// Open a connection from a `file:` URI and confirm liveness
    fn open(uri: &str) -> Result<Connection> {
        let flags = OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(uri, flags)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    }

    fn open_pair(db: &IsolatedDatabase) -> Result<ConnectionPair> {
        Ok(ConnectionPair {
            primary: Self::open(&db.primary_uri)?,
            keys: Self::open(&db.keys_uri)?,
        })
    }

    fn bootstrap(pair: &ConnectionPair) -> Result<()> {
        pair.primary.execute_batch(PRIMARY_SCHEMA)?;
        pair.keys.execute_batch(KEYS_SCHEMA)?;
        Ok(())
    }
}

impl IsolationBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn provision(&self, id: &str) -> Result<IsolatedDatabase> {
        let dir = self.base_dir.join(id);
        fs::create_dir_all(&dir).map_err(Error::provisioning)?;

        let primary_path = dir.join("primary.db");
        let keys_path = dir.join("keys.db");
        let record = IsolatedDatabase {
            instance_id: id.to_string(),
            backend: BackendKind::Sqlite,
            primary_uri: Self::file_uri(&primary_path),
            keys_uri: Self::file_uri(&keys_path),
            primary_path: Some(primary_path),
            keys_path: Some(keys_path),
            primary_db_name: None,
            keys_db_name: None,
            created_at: Utc::now(),
        };

        let pair = Self::open_pair(&record)?;
        Self::bootstrap(&pair)?;

        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(id.to_string(), pair);
        }
        debug!(instance = id, dir = %dir.display(), "sqlite storage provisioned");
        Ok(record)
    }

    fn close(&self, id: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(id);
        }
    }

    fn destroy(&self, db: &IsolatedDatabase) {
        // Missing files are fine: removal is idempotent.
        for path in [&db.primary_path, &db.keys_path].into_iter().flatten() {
            if path.exists() {
                if let Err(err) = fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove storage file: {err}");
                }
            }
        }
        let dir = self.base_dir.join(&db.instance_id);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), "failed to remove storage directory: {err}");
            }
        }
    }

    fn backup(&self, db: &IsolatedDatabase, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(Error::persistence)?;

        // Close first so the copies see fully flushed files.
        self.close(&db.instance_id);
        for path in [&db.primary_path, &db.keys_path].into_iter().flatten() {
            let name = path
                .file_name()
                .ok_or_else(|| Error::Persistence(format!("bad storage path {}", path.display())))?;
            fs::copy(path, dest.join(name)).map_err(Error::persistence)?;
        }

        let pair = Self::open_pair(db)?;
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(db.instance_id.clone(), pair);
        }
        Ok(())
    }

    fn restore(&self, db: &IsolatedDatabase, src: &Path) -> Result<()> {
        self.close(&db.instance_id);
        for path in [&db.primary_path, &db.keys_path].into_iter().flatten() {
            let name = path
                .file_name()
                .ok_or_else(|| Error::Persistence(format!("bad storage path {}", path.display())))?;
            let source = src.join(name);
            if !source.exists() {
                return Err(Error::Persistence(format!(
                    "backup file {} not found",
                    source.display()
                )));
            }
            fs::copy(&source, path).map_err(Error::persistence)?;
        }

        let pair = Self::open_pair(db)?;
        Self::bootstrap(&pair)?;
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(db.instance_id.clone(), pair);
        }
        Ok(())
    }

    fn close_all(&self) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.clear();
        }
    }
}
