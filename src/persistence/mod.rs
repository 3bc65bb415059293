//! Registry persistence - flat JSON registry plus one config file per instance
//!
//! Pure serialization; the registry file is rewritten wholesale on every
//! structural change. No locking against concurrent external modification is
//! attempted: a single manager process owns a registry directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Instance, InstanceConfig};
use crate::error::{Error, Result};

/// One row of the on-disk instance registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub port: u16,
    pub working_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl From<&Instance> for RegistryEntry {
    fn from(instance: &Instance) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            phone: instance.phone.clone(),
            port: instance.port,
            working_dir: instance.working_dir.clone(),
            config_path: instance.config_path.clone(),
            log_path: instance.log_path.clone(),
            created_at: instance.created_at,
            metadata: instance.metadata.clone(),
        }
    }
}

/// Write the whole registry to disk
pub fn save_registry(path: &Path, entries: &HashMap<String, RegistryEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::persistence)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(path, json).map_err(Error::persistence)?;
    debug!(path = %path.display(), entries = entries.len(), "registry saved");
    Ok(())
}

/// Read the registry from disk; a missing file is an empty registry
pub fn load_registry(path: &Path) -> Result<HashMap<String, RegistryEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let json = fs::read_to_string(path).map_err(Error::persistence)?;
    let entries = serde_json::from_str(&json)?;
    Ok(entries)
}

/// Write one instance's config file
pub fn save_config(path: &Path, config: &InstanceConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::persistence)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json).map_err(Error::persistence)?;
    debug!(path = %path.display(), "instance config saved");
    Ok(())
}

/// Read one instance's config file back, unchanged
pub fn load_config(path: &Path) -> Result<InstanceConfig> {
    let json = fs::read_to_string(path).map_err(Error::persistence)?;
    let config = serde_json::from_str(&json)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, port: u16) -> RegistryEntry {
        RegistryEntry {
            id: id.to_string(),
            name: id.to_string(),
            phone: "+1555".to_string(),
            port,
            working_dir: PathBuf::from("/data").join(id),
            config_path: PathBuf::from("/data").join(id).join("config.json"),
            log_path: PathBuf::from("/data").join(id).join("logs/instance.log"),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn registry_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut entries = HashMap::new();
        entries.insert("a-1".to_string(), entry("a-1", 3001));
        entries.insert("b-2".to_string(), entry("b-2", 3002));

        save_registry(&path, &entries).unwrap();
        let loaded = load_registry(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a-1"].port, 3001);
        assert_eq!(loaded["b-2"].name, "b-2");
    }

    #[test]
    fn missing_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_registry(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn config_roundtrip_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = InstanceConfig {
            port: 3005,
            debug: true,
            auto_reply: "away".to_string(),
            webhooks: vec!["https://example.com/hook".to_string()],
            ..Default::default()
        };
        config
            .environment
            .insert("TZ".to_string(), "UTC".to_string());

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.port, 3005);
        assert!(loaded.debug);
        assert_eq!(loaded.auto_reply, "away");
        assert_eq!(loaded.webhooks, config.webhooks);
        assert_eq!(loaded.environment.get("TZ").map(String::as_str), Some("UTC"));
    }
}
