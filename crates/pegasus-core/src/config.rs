//! Typed config entries with a JSON file round-trip.
//!
//! Each participant registers its config types under a stable path, can dump
//! the defaults to a JSON file, and loads a (possibly partial) file back:
//! entries present in the file are decoded into the registered type, missing
//! entries fall back to their defaults.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Default)]
pub struct ConfigSchema {
    defaults: BTreeMap<String, Value>,
    values: BTreeMap<String, Value>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed entry under `path`. Duplicate paths are fatal.
    pub fn register_entry<T: Serialize>(&mut self, path: &str, default: &T) -> anyhow::Result<()> {
        if self.defaults.contains_key(path) {
            anyhow::bail!("cfg entry {path:?} already registered");
        }
        let blob = serde_json::to_value(default)
            .with_context(|| format!("fail to encode default for cfg entry {path:?}"))?;
        self.defaults.insert(path.to_string(), blob.clone());
        self.values.insert(path.to_string(), blob);
        Ok(())
    }

    /// Decode the current value of an entry into its registered type.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let blob = self
            .values
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("cfg path {path:?} not found"))?;
        serde_json::from_value(blob.clone())
            .with_context(|| format!("fail to decode cfg entry {path:?}"))
    }

    pub fn save_defaults(&self, path: &Path) -> anyhow::Result<()> {
        write_json_map(path, &self.defaults)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json_map(path, &self.values)
    }

    /// Load entries from a JSON file written by `save`/`save_defaults`.
    ///
    /// Registered paths missing from the file keep their defaults; unknown
    /// paths in the file are ignored.
    pub fn load_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("fail to read cfg file {}", path.display()))?;
        let file: BTreeMap<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("fail to parse cfg file {}", path.display()))?;

        for (entry_path, default) in &self.defaults {
            match file.get(entry_path) {
                Some(blob) => {
                    tracing::debug!(path = %entry_path, "load cfg from file");
                    self.values.insert(entry_path.clone(), blob.clone());
                }
                None => {
                    tracing::debug!(path = %entry_path, "load cfg from default");
                    self.values.insert(entry_path.clone(), default.clone());
                }
            }
        }
        Ok(())
    }
}

fn write_json_map(path: &Path, map: &BTreeMap<String, Value>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(map)?;
    std::fs::write(path, json)
        .with_context(|| format!("fail to write cfg file {}", path.display()))?;
    Ok(())
}
