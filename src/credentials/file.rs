//! YAML-file-backed credential store.
//!
//! ```yaml
//! api_keys:
//!   - api_key: "k-3f9a..."
//!     client_id: acme
//!     active: true
//!     expires_at: "2030-01-01T00:00:00Z"
//!     usage_limits:
//!       requests_per_second: 20
//!       max_payload_size_mb: 6
//!     platform_data:
//!       tier: gold
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ClientRecord, CredentialError, CredentialValidator};
use crate::error::{GatekeeperError, Result};

#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    api_keys: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize)]
struct CredentialEntry {
    api_key: String,
    #[serde(flatten)]
    record: ClientRecord,
}

/// Credential records loaded from a YAML file and held in memory.
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<String, ClientRecord>>,
}

impl FileCredentialStore {
    /// Load credentials from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let records = load(path)?;
        info!(path = %path.display(), keys = records.len(), "Loaded API keys");

        Ok(Self {
            path: Some(path.to_path_buf()),
            records: RwLock::new(records),
        })
    }

    /// Load credentials from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(Self {
            path: None,
            records: RwLock::new(parse(yaml)?),
        })
    }

    /// Re-read the backing file, replacing all records atomically.
    ///
    /// On failure the previous records stay in place. Stores created from a
    /// string have nothing to reload and keep their records.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.len());
        };

        let records = load(path)?;
        let count = records.len();
        *self.records.write() = records;
        debug!(path = %path.display(), keys = count, "Reloaded API keys");
        Ok(count)
    }

    /// Number of known API keys.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no API keys are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load(path: &Path) -> Result<HashMap<String, ClientRecord>> {
    let contents = std::fs::read_to_string(path)?;
    parse(&contents)
}

fn parse(yaml: &str) -> Result<HashMap<String, ClientRecord>> {
    let file: CredentialFile = serde_yaml::from_str(yaml)
        .map_err(|e| GatekeeperError::Config(format!("Failed to parse credential file: {}", e)))?;

    let mut records = HashMap::with_capacity(file.api_keys.len());
    for entry in file.api_keys {
        if entry.api_key.is_empty() {
            return Err(CredentialError::Malformed("empty api_key".to_string()).into());
        }
        if entry.record.client_id.is_empty() {
            return Err(CredentialError::Malformed(format!(
                "empty client_id for key ending in {}",
                key_suffix(&entry.api_key)
            ))
            .into());
        }
        if records.insert(entry.api_key.clone(), entry.record).is_some() {
            return Err(CredentialError::Malformed(format!(
                "duplicate key ending in {}",
                key_suffix(&entry.api_key)
            ))
            .into());
        }
    }
    Ok(records)
}

/// Last four characters of a key, for logs and errors.
fn key_suffix(api_key: &str) -> &str {
    let start = api_key
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &api_key[start..]
}

#[async_trait]
impl CredentialValidator for FileCredentialStore {
    async fn validate(&self, api_key: &str) -> std::result::Result<ClientRecord, CredentialError> {
        match self.records.read().get(api_key) {
            Some(record) => Ok(record.clone()),
            None => {
                info!(key_suffix = key_suffix(api_key), "API key not found");
                Err(CredentialError::NotFound)
            }
        }
    }
}
