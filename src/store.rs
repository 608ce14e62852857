// Store module - persistent repository of upstream API configurations
//
// The store is a single JSON document (data/db.json) guarded by a RwLock.
// Proxy requests take read snapshots; CRUD operations take the write lock
// and persist the whole document before returning, so an in-flight request
// never observes a half-updated configuration.
//
// Field names use camelCase on disk (apiKey, activeConfig) to stay
// compatible with db.json files written by earlier versions of this tool.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// A saved upstream endpoint/credential set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub id: String,
    pub name: String,
    /// Base URL of the upstream API, no trailing slash
    pub endpoint: String,
    pub api_key: String,
    /// Optional model override; when set it replaces the model named
    /// in forwarded request bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The persisted document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    #[serde(default)]
    api_configs: Vec<UpstreamConfig>,
    #[serde(default)]
    active_config: Option<String>,
    #[serde(default)]
    debug_mode: bool,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "zh".to_string()
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            api_configs: Vec::new(),
            active_config: None,
            debug_mode: false,
            language: default_language(),
        }
    }
}

/// JSON-file-backed configuration store
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl ConfigStore {
    /// Open (or initialize) the store under the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let path = data_dir.join("db.json");

        let data = match fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).context("Failed to parse store file")?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e).context("Failed to read store file"),
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        {
            let data = store.data.read().unwrap();
            store.persist(&data)?;
        }
        Ok(store)
    }

    /// Write the given document to disk (temp file + rename, so a crash
    /// mid-write never leaves a truncated db.json). Callers invoke this while
    /// still holding the write lock, so concurrent mutations cannot race the
    /// shared temp file.
    fn persist(&self, data: &StoreData) -> Result<()> {
        let json = serde_json::to_string_pretty(data).context("Failed to serialize store")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write store file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace store file")?;
        Ok(())
    }

    /// List all saved configurations
    pub fn list(&self) -> Vec<UpstreamConfig> {
        self.data.read().unwrap().api_configs.clone()
    }

    /// Look up a configuration by id
    pub fn find(&self, id: &str) -> Option<UpstreamConfig> {
        self.data
            .read()
            .unwrap()
            .api_configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Id of the active configuration, if any
    pub fn active_id(&self) -> Option<String> {
        self.data.read().unwrap().active_config.clone()
    }

    /// Create a new configuration. The first configuration ever created is
    /// automatically activated.
    pub fn create(
        &self,
        name: String,
        endpoint: String,
        api_key: String,
        model: Option<String>,
    ) -> Result<UpstreamConfig> {
        let config = UpstreamConfig {
            id: generate_config_id(),
            name,
            endpoint,
            api_key,
            model,
        };
        let mut data = self.data.write().unwrap();
        data.api_configs.push(config.clone());
        if data.api_configs.len() == 1 {
            data.active_config = Some(config.id.clone());
        }
        self.persist(&data)?;
        Ok(config)
    }

    /// Replace the fields of an existing configuration.
    /// Returns the updated record, or None if the id is unknown.
    pub fn update(
        &self,
        id: &str,
        name: String,
        endpoint: String,
        api_key: String,
        model: Option<String>,
    ) -> Result<Option<UpstreamConfig>> {
        let mut data = self.data.write().unwrap();
        let updated = match data.api_configs.iter_mut().find(|c| c.id == id) {
            Some(config) => {
                config.name = name;
                config.endpoint = endpoint;
                config.api_key = api_key;
                config.model = model;
                Some(config.clone())
            }
            None => None,
        };
        if updated.is_some() {
            self.persist(&data)?;
        }
        Ok(updated)
    }

    /// Delete a configuration. If it was the active one, the first remaining
    /// configuration is promoted (or the active reference is cleared).
    /// Returns false if the id is unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut data = self.data.write().unwrap();
        let before = data.api_configs.len();
        data.api_configs.retain(|c| c.id != id);
        let removed = data.api_configs.len() != before;
        if removed && data.active_config.as_deref() == Some(id) {
            data.active_config = data.api_configs.first().map(|c| c.id.clone());
        }
        if removed {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    /// Mark a configuration as active. Returns false if the id is unknown.
    pub fn activate(&self, id: &str) -> Result<bool> {
        let mut data = self.data.write().unwrap();
        let found = if data.api_configs.iter().any(|c| c.id == id) {
            data.active_config = Some(id.to_string());
            true
        } else {
            false
        };
        if found {
            self.persist(&data)?;
        }
        Ok(found)
    }

    pub fn debug_mode(&self) -> bool {
        self.data.read().unwrap().debug_mode
    }

    pub fn set_debug_mode(&self, enabled: bool) -> Result<()> {
        let mut data = self.data.write().unwrap();
        data.debug_mode = enabled;
        self.persist(&data)
    }

    pub fn language(&self) -> String {
        self.data.read().unwrap().language.clone()
    }

    pub fn set_language(&self, language: String) -> Result<()> {
        let mut data = self.data.write().unwrap();
        data.language = language;
        self.persist(&data)
    }
}

/// Generate a unique configuration id
/// Format: epoch-millis + process-local counter, so ids created in the same
/// millisecond stay distinct
fn generate_config_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), count)
}
