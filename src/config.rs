//! Immutable, validated configuration mapping with typed, dotted-path
//! access, per `spec.md` §1 non-goals / §6 ("the driver receives a
//! validated mapping"). Parsing a config file into this mapping and
//! generating CLI flags from a schema are explicitly out of scope; this
//! module only owns the in-memory representation every other component
//! reads from.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Error, Result};

/// The recognized top-level keys and their effects are listed in
/// `spec.md` §6: `workdir`, `resultdir`, `logdir`, `tag`, `samples_file`,
/// `executor.{name,cpus,memory}`, `log.{level,external}`. Anything else is
/// carried through opaquely for user mixins/hooks to read.
#[derive(Debug, Clone)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Unwraps back into the raw mapping, for callers (the CLI's flag
    /// overrides) that need to layer additional values on top.
    pub fn into_value(self) -> Value {
        self.root
    }

    /// Reads a TOML, YAML, or JSON file into a flat `serde_json::Value`
    /// map. This is ambient plumbing (`spec.md`'s explicit config-format
    /// non-goal covers only the CLI-facing parser; something still has to
    /// turn bytes on disk into the validated mapping every other module
    /// assumes already exists).
    pub fn read(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let raw = std::fs::read_to_string(path)?;
        let root: Value = match ext {
            "toml" => toml::from_str::<toml::Value>(&raw)
                .map_err(Error::Toml)
                .and_then(|v| serde_json::to_value(v).map_err(Error::Json))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            "json" => serde_json::from_str(&raw)?,
            other => {
                return Err(Error::ConfigPath(format!(
                    "unsupported config file extension: {other}"
                )));
            }
        };
        Ok(Self::from_value(root))
    }

    /// Looks up a dotted path (`"executor.cpus"`) and deserializes it as
    /// `T`. Missing keys yield `Ok(None)`; a value present but of the
    /// wrong shape is a `ConfigType` error naming the path.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(value) = self.lookup(path) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|cause| Error::ConfigType { path: path.to_string(), cause: cause.to_string() })
    }

    /// Same as [`Config::get`] but fails with `ConfigPath` if the key is
    /// absent, for keys the driver treats as required.
    pub fn require<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path)?.ok_or_else(|| Error::ConfigPath(path.to_string()))
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for segment in path.split('.') {
            cur = cur.as_object()?.get(segment)?;
        }
        Some(cur)
    }

    pub fn workdir(&self) -> Result<std::path::PathBuf> {
        self.require("workdir")
    }

    pub fn resultdir(&self) -> Result<std::path::PathBuf> {
        self.require("resultdir")
    }

    pub fn tag(&self) -> Result<String> {
        Ok(self.get("tag")?.unwrap_or_else(|| "default".to_string()))
    }

    pub fn samples_file(&self) -> Result<std::path::PathBuf> {
        self.require("samples_file")
    }

    pub fn executor_name(&self) -> Result<String> {
        Ok(self.get("executor.name")?.unwrap_or_else(|| "subprocess".to_string()))
    }

    /// Concurrent shard limit; `None` means the driver should pick a
    /// default (the host's available parallelism).
    pub fn executor_cpus(&self) -> Result<Option<usize>> {
        self.get("executor.cpus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_path_lookup() {
        let cfg = Config::from_value(json!({"executor": {"cpus": 4}}));
        assert_eq!(cfg.get::<u32>("executor.cpus").unwrap(), Some(4));
    }

    #[test]
    fn missing_key_is_none() {
        let cfg = Config::from_value(json!({}));
        assert_eq!(cfg.get::<u32>("executor.cpus").unwrap(), None);
    }

    #[test]
    fn wrong_type_is_config_type_error() {
        let cfg = Config::from_value(json!({"tag": {"nested": true}}));
        let err = cfg.get::<String>("tag").unwrap_err();
        assert!(matches!(err, Error::ConfigType { .. }));
    }

    #[test]
    fn default_tag_is_default() {
        let cfg = Config::from_value(json!({}));
        assert_eq!(cfg.tag().unwrap(), "default");
    }
}
