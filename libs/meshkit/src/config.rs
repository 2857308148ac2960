//! Configuration resolution for the mesh.
//!
//! The mesh never parses raw sources itself. Each [`ConfigLoader`] merges its
//! providers into a [`Figment`]; [`resolve`] folds all loaders in order (later
//! loaders override earlier ones) and extracts a single JSON tree wrapped in a
//! [`ConfigNode`].
//!
//! Layout of the resolved tree:
//!
//! ```yaml
//! mesh:
//!   modules:
//!     <module>: { ... }    # handed to Module::configure
//!   services:
//!     <service>: { ... }   # handed to the service factory
//!   agent: { ... }         # read by the remote agent
//! ```
//!
//! Two ways of reading a node, mirroring each other:
//! 1. **Strict**: [`ConfigNode::extract`] requires the node to be present and valid.
//! 2. **Lenient**: [`ConfigNode::extract_or_default`] falls back to `T::default()`
//!    when the node is missing.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Root key of everything the mesh reads.
pub const ROOT_KEY: &str = "mesh";

/// Configuration error for config resolution and typed access.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to merge configuration sources: {0}")]
    Merge(#[source] Box<figment::Error>),
    #[error("config node '{path}' must be an object")]
    InvalidStructure { path: String },
    #[error("missing config node '{path}'")]
    Missing { path: String },
    #[error("invalid config at '{path}': {source}")]
    InvalidConfig {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A source of configuration.
///
/// Loaders are applied in the order they are given to [`resolve`]; values merged
/// by a later loader win over earlier ones.
pub trait ConfigLoader: Send + Sync {
    /// Merge this loader's providers into `figment`.
    fn load(&self, figment: Figment) -> Figment;
}

/// YAML file source. A missing file contributes nothing.
#[derive(Debug, Clone)]
pub struct YamlFile {
    path: PathBuf,
}

impl YamlFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigLoader for YamlFile {
    fn load(&self, figment: Figment) -> Figment {
        figment.merge(Yaml::file(&self.path))
    }
}

/// Environment variables with a prefix; `__` separates nesting levels.
///
/// `APP__MESH__SERVICES__GREETER__GREETING=hi` with prefix `APP__` becomes
/// `mesh.services.greeter.greeting = "hi"`.
#[derive(Debug, Clone)]
pub struct EnvVars {
    prefix: String,
}

impl EnvVars {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl ConfigLoader for EnvVars {
    fn load(&self, figment: Figment) -> Figment {
        figment.merge(Env::prefixed(&self.prefix).split("__"))
    }
}

/// In-memory JSON source, mostly for tests and programmatic defaults.
#[derive(Debug, Clone)]
pub struct Inline {
    value: Value,
}

impl Inline {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl ConfigLoader for Inline {
    fn load(&self, figment: Figment) -> Figment {
        figment.merge(Serialized::defaults(self.value.clone()))
    }
}

/// Merge all loaders into one resolved configuration tree.
///
/// # Errors
/// Returns `ConfigError::Merge` if any source fails to parse or the merged tree
/// cannot be extracted.
pub fn resolve(loaders: &[&dyn ConfigLoader]) -> Result<ConfigNode, ConfigError> {
    let figment = loaders
        .iter()
        .fold(Figment::new(), |figment, loader| loader.load(figment));

    let value: Value = figment
        .extract()
        .map_err(|e| ConfigError::Merge(Box::new(e)))?;

    tracing::debug!(sources = loaders.len(), "configuration resolved");
    Ok(ConfigNode::root(value))
}

/// A node of the resolved configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigNode {
    path: String,
    value: Value,
}

impl Default for ConfigNode {
    fn default() -> Self {
        Self::root(Value::Object(serde_json::Map::new()))
    }
}

impl ConfigNode {
    /// Wrap a JSON value as the root of a tree.
    #[must_use]
    pub fn root(value: Value) -> Self {
        Self {
            path: String::new(),
            value,
        }
    }

    /// Dotted path of this node from the root (empty for the root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// `true` for `null` and for an empty object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Descend along `path`.
    ///
    /// A missing key yields an empty node; only a non-object value along the
    /// way is an error.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidStructure` if an intermediate node is not an object.
    pub fn sub_config(&self, path: &[&str]) -> Result<ConfigNode, ConfigError> {
        let mut current = &self.value;
        let mut current_path = self.path.clone();

        for segment in path {
            let obj = match current {
                Value::Object(obj) => obj,
                Value::Null => return Ok(self.empty_at(path)),
                _ => {
                    return Err(ConfigError::InvalidStructure { path: current_path });
                }
            };

            current_path = join_path(&current_path, segment);
            match obj.get(*segment) {
                Some(next) => current = next,
                None => return Ok(self.empty_at(path)),
            }
        }

        Ok(ConfigNode {
            path: current_path,
            value: current.clone(),
        })
    }

    /// Strictly deserialize this node.
    ///
    /// # Errors
    /// Returns `ConfigError::Missing` if the node is empty, or
    /// `ConfigError::InvalidConfig` if it does not deserialize into `T`.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::Missing {
                path: self.path.clone(),
            });
        }
        self.deserialize()
    }

    /// Deserialize this node, or return `T::default()` when it is empty.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidConfig` if the node is present but invalid.
    pub fn extract_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        if self.is_empty() {
            return Ok(T::default());
        }
        self.deserialize()
    }

    fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(self.value.clone()).map_err(|source| ConfigError::InvalidConfig {
            path: self.path.clone(),
            source,
        })
    }

    fn empty_at(&self, path: &[&str]) -> ConfigNode {
        let full = path
            .iter()
            .fold(self.path.clone(), |acc, segment| join_path(&acc, segment));
        ConfigNode {
            path: full,
            value: Value::Object(serde_json::Map::new()),
        }
    }
}

fn join_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_owned()
    } else {
        format!("{base}.{segment}")
    }
}
