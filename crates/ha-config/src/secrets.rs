//! `secrets.yaml` lookup for `!secret` tags

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

pub const SECRETS_FILE: &str = "secrets.yaml";

/// Secrets loaded from `secrets.yaml` next to the configuration file
#[derive(Debug, Clone)]
pub struct Secrets {
    values: HashMap<String, Value>,
    path: PathBuf,
}

impl Secrets {
    /// Load `secrets.yaml` from `config_dir`; a missing file means no secrets
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(SECRETS_FILE);

        if !path.exists() {
            debug!("No {} found at {:?}", SECRETS_FILE, path);
            return Ok(Self::empty(path));
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let values: Option<HashMap<String, Value>> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;
        let values = values.unwrap_or_default();

        debug!("Loaded {} secrets from {:?}", values.len(), path);
        Ok(Self { values, path })
    }

    pub fn empty(path: PathBuf) -> Self {
        Self {
            values: HashMap::new(),
            path,
        }
    }

    /// Secret value with its YAML type preserved (a port stays a number)
    pub fn get(&self, key: &str) -> ConfigResult<&Value> {
        self.values.get(key).ok_or_else(|| ConfigError::SecretNotFound {
            key: key.to_string(),
            path: self.path.clone(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
