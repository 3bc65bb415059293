//! Networked-relational backend - per-instance databases on a shared server
//!
//! One PostgreSQL server, configured by a base connection URI, hosts every
//! instance's primary and key-material databases. Database names are derived
//! from the instance ID; connection strings reuse the base URI with its
//! database-name segment substituted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{BackendKind, IsolatedDatabase, IsolationBackend};

/// Primary database schema, PostgreSQL column types
const PRIMARY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instance_info (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    session_data BYTEA,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    body TEXT,
    timestamp BIGINT NOT NULL,
    is_from_me BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS contacts (
    jid TEXT PRIMARY KEY,
    name TEXT,
    notify TEXT,
    updated_at TIMESTAMPTZ
);
"#;

/// Key-material database schema, PostgreSQL column types
const KEYS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS encryption_keys (
    id TEXT PRIMARY KEY,
    key_data BYTEA NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS session_keys (
    session_id TEXT PRIMARY KEY,
    key_data BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

struct ClientPair {
    primary: Client,
    keys: Client,
}

/// PostgreSQL implementation over a shared base connection URI
pub(crate) struct PostgresBackend {
    base_uri: String,
    connections: Mutex<HashMap<String, ClientPair>>,
}

impl PostgresBackend {
    pub fn new(base_uri: String) -> Self {
        Self {
            base_uri,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn admin(&self) -> Result<Client> {
        Client::connect(&self.base_uri, NoTls).map_err(Error::from)
    }

    fn open(uri: &str) -> Result<Client> {
        let mut client = Client::connect(uri, NoTls)?;
        client.simple_query("SELECT 1")?;
        Ok(client)
    }

    fn create_database_if_missing(admin: &mut Client, name: &str) -> Result<()> {
        let exists = admin
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])?
            .is_some();
        if !exists {
            // Identifiers cannot be parameterized; `name` is sanitized.
            admin.batch_execute(&format!("CREATE DATABASE \"{name}\""))?;
        }
        Ok(())
    }

    fn drop_database(admin: &mut Client, name: &str) {
        // Evict lingering sessions so the drop does not fail on "in use".
        let terminated = admin.query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&name],
        );
        if let Err(err) = terminated {
            warn!(database = name, "failed to terminate connections: {err}");
        }
        if let Err(err) = admin.batch_execute(&format!("DROP DATABASE IF EXISTS \"{name}\"")) {
            warn!(database = name, "failed to drop database: {err}");
        }
    }
}

impl IsolationBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn provision(&self, id: &str) -> Result<IsolatedDatabase> {
        let token = sanitize_identifier(id);
        let primary_name = token.clone();
        let keys_name = format!("{token}_keys");

        let mut admin = self.admin()?;
        Self::create_database_if_missing(&mut admin, &primary_name)?;
        Self::create_database_if_missing(&mut admin, &keys_name)?;

        let primary_uri = replace_database_name(&self.base_uri, &primary_name);
        let keys_uri = replace_database_name(&self.base_uri, &keys_name);

        let mut primary = Self::open(&primary_uri)?;
        primary.batch_execute(PRIMARY_SCHEMA)?;
        let mut keys = Self::open(&keys_uri)?;
        keys.batch_execute(KEYS_SCHEMA)?;

        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(id.to_string(), ClientPair { primary, keys });
        }
        debug!(instance = id, primary = %primary_name, keys = %keys_name,
               "postgres databases provisioned");

        Ok(IsolatedDatabase {
            instance_id: id.to_string(),
            backend: BackendKind::Postgres,
            primary_path: None,
            keys_path: None,
            primary_db_name: Some(primary_name),
            keys_db_name: Some(keys_name),
            primary_uri,
            keys_uri,
            created_at: Utc::now(),
        })
    }

    fn close(&self, id: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(id);
        }
    }

    fn destroy(&self, db: &IsolatedDatabase) {
        let mut admin = match self.admin() {
            Ok(client) => client,
            Err(err) => {
                warn!(instance = %db.instance_id, "cannot reach server for teardown: {err}");
                return;
            }
        };
        for name in [&db.primary_db_name, &db.keys_db_name].into_iter().flatten() {
            Self::drop_database(&mut admin, name);
        }
    }

    fn backup(&self, _db: &IsolatedDatabase, _dest: &Path) -> Result<()> {
        Err(Error::Unsupported(
            "backup is not available on the postgres backend".to_string(),
        ))
    }

    fn restore(&self, _db: &IsolatedDatabase, _src: &Path) -> Result<()> {
        Err(Error::Unsupported(
            "restore is not available on the postgres backend".to_string(),
        ))
    }

    fn close_all(&self) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.clear();
        }
    }
}

/// Reduce an instance ID to a PostgreSQL-identifier-safe token
pub(crate) fn sanitize_identifier(id: &str) -> String {
    let mut token: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if !token.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        token.insert_str(0, "db_");
    }
    token
}

/// Substitute the database-name path segment of a connection URI
///
/// Handles both query-parameter and bare URI shapes:
/// `postgres://u:p@host:5432/main?sslmode=disable` and
/// `postgres://u:p@host:5432/main`.
pub fn replace_database_name(base_uri: &str, db_name: &str) -> String {
    let (head, query) = match base_uri.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (base_uri, None),
    };

    let scheme_end = head.find("://").map(|i| i + 3).unwrap_or(0);
    let mut out = match head[scheme_end..].rfind('/') {
        Some(slash) => format!("{}/{}", &head[..scheme_end + slash], db_name),
        None => format!("{head}/{db_name}"),
    };
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_with_query_params() {
        assert_eq!(
            replace_database_name("postgres://u:p@host:5432/main?sslmode=disable", "tenant_7"),
            "postgres://u:p@host:5432/tenant_7?sslmode=disable"
        );
    }

    #[test]
    fn rewrite_without_query_params() {
        assert_eq!(
            replace_database_name("postgres://u:p@host:5432/main", "tenant_7"),
            "postgres://u:p@host:5432/tenant_7"
        );
    }

    #[test]
    fn rewrite_without_database_segment() {
        assert_eq!(
            replace_database_name("postgres://u:p@host:5432", "tenant_7"),
            "postgres://u:p@host:5432/tenant_7"
        );
    }

    #[test]
    fn identifier_sanitization() {
        assert_eq!(sanitize_identifier("alice-1724412345"), "alice_1724412345");
        assert_eq!(sanitize_identifier("7days"), "db_7days");
        assert_eq!(sanitize_identifier("My.Name"), "my_name");
    }
}
