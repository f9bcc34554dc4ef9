//! YAML loading with tag substitution
//!
//! Supported tags:
//! - `!secret key` - value from `secrets.yaml`
//! - `!env_var VAR` or `!env_var VAR fallback` - environment variable
//! - `!include path` - another YAML file, relative to the including file

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;

/// Resolves tags while walking a parsed document
pub struct YamlLoader {
    secrets: Secrets,
    /// Files currently being loaded, innermost last
    stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader for files in `config_dir`, with that directory's secrets
    pub fn new(config_dir: &Path) -> ConfigResult<Self> {
        Ok(Self::with_secrets(Secrets::load(config_dir)?))
    }

    pub fn with_secrets(secrets: Secrets) -> Self {
        Self {
            secrets,
            stack: Vec::new(),
        }
    }

    pub fn load_file(&mut self, path: &Path) -> ConfigResult<Value> {
        if self.stack.iter().any(|open| open == path) {
            return Err(ConfigError::CircularInclude {
                path: path.to_path_buf(),
            });
        }

        debug!("Loading YAML file: {:?}", path);
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        self.stack.push(path.to_path_buf());
        let result = self.load_str(&content, path);
        self.stack.pop();
        result
    }

    /// Parse `content` as if it were read from `origin`
    pub fn load_str(&mut self, content: &str, origin: &Path) -> ConfigResult<Value> {
        let document: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: origin.to_path_buf(),
                source,
            })?;
        self.resolve(document, origin)
    }

    fn resolve(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, origin),
            Value::Mapping(mapping) => {
                let mut resolved = Mapping::with_capacity(mapping.len());
                for (key, value) in mapping {
                    resolved.insert(key, self.resolve(value, origin)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, origin))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            scalar => Ok(scalar),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Resolving tag {} in {:?}", tag, origin);

        match tag.as_str() {
            "!secret" => {
                let key = scalar_argument(&tag, &tagged.value)?;
                let value = self.secrets.get(key)?.clone();
                debug!("Substituted secret: {}", key);
                Ok(value)
            }
            "!env_var" => {
                let argument = scalar_argument(&tag, &tagged.value)?;
                env_var(argument)
            }
            "!include" => {
                let relative = scalar_argument(&tag, &tagged.value)?;
                let base = origin.parent().unwrap_or_else(|| Path::new("."));
                let path = base.join(relative);
                self.load_file(&path)
            }
            _ => {
                // Not ours; keep the tag and resolve inside it
                let value = self.resolve(tagged.value, origin)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }
}

fn scalar_argument<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Ok(text.trim()),
        _ => Err(ConfigError::InvalidTag {
            tag: tag.to_string(),
            reason: "expected a non-empty string".to_string(),
        }),
    }
}

/// `VAR` or `VAR fallback`; the fallback is parsed as YAML so numbers stay numbers
fn env_var(argument: &str) -> ConfigResult<Value> {
    let (name, fallback) = match argument.split_once(char::is_whitespace) {
        Some((name, fallback)) => (name, Some(fallback.trim())),
        None => (argument, None),
    };

    match (std::env::var(name), fallback) {
        (Ok(value), _) => {
            debug!("Substituted env var: {}", name);
            Ok(Value::String(value))
        }
        (Err(_), Some(fallback)) => {
            Ok(serde_yaml::from_str(fallback).unwrap_or_else(|_| Value::String(fallback.to_string())))
        }
        (Err(_), None) => Err(ConfigError::EnvVarNotFound {
            var: name.to_string(),
        }),
    }
}

/// Load `path` with secrets from its directory and every tag resolved
pub fn load_yaml(path: &Path) -> ConfigResult<Value> {
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    YamlLoader::new(config_dir)?.load_file(path)
}
