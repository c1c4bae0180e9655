// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Plugin settings and the settings store
//!
//! Every plugin instance carries two [`Settings`] maps: init settings, fixed
//! when the instance is constructed, and runtime settings, replaced as a
//! whole on every reload. The [`SettingsStore`] keeps both per instance name
//! and detects whether a reload actually changed anything.
//!
//! Values come from configuration files written by hand, so the typed
//! getters are lenient: `"10"` and `10` are the same number, `"True"`,
//! `"yes"`, `1` and `true` are the same boolean.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, SettingError};

/// Key/value settings for one plugin instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);

impl Settings {
    /// Create an empty settings map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Check if a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value; numbers and booleans are rendered as text
    pub fn get_str(&self, key: &str) -> Result<Option<String>, SettingError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(SettingError::new(
                key,
                format!("expected a string, got {}", other),
            )),
        }
    }

    /// Unsigned integer value; accepts numbers and numeric strings
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, SettingError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| SettingError::new(key, format!("expected an unsigned integer, got {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| SettingError::new(key, format!("expected an unsigned integer, got '{}'", s))),
            Some(other) => Err(SettingError::new(
                key,
                format!("expected an unsigned integer, got {}", other),
            )),
        }
    }

    /// Boolean value; accepts booleans, 0/1 and the usual words
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, SettingError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(SettingError::new(key, format!("expected a boolean, got {}", n))),
            },
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" | "" => Ok(Some(false)),
                _ => Err(SettingError::new(key, format!("expected a boolean, got '{}'", s))),
            },
            Some(other) => Err(SettingError::new(
                key,
                format!("expected a boolean, got {}", other),
            )),
        }
    }

    /// Required string value
    pub fn require_str(&self, key: &str) -> Result<String, SettingError> {
        self.get_str(key)?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SettingError::new(key, "required setting is missing"))
    }

    /// Required unsigned integer value
    pub fn require_u64(&self, key: &str) -> Result<u64, SettingError> {
        self.get_u64(key)?
            .ok_or_else(|| SettingError::new(key, "required setting is missing"))
    }

    /// String value with a default
    pub fn str_or(&self, key: &str, default: &str) -> Result<String, SettingError> {
        Ok(self.get_str(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Unsigned integer value with a default
    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, SettingError> {
        Ok(self.get_u64(key)?.unwrap_or(default))
    }

    /// Boolean value with a default
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, SettingError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Outcome of installing a new runtime snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsChange {
    /// The new snapshot equals the current one
    Unchanged,
    /// The snapshot was replaced
    Changed {
        /// Revision of the installed snapshot
        revision: u64,
        /// The installed snapshot
        settings: Arc<Settings>,
    },
}

impl SettingsChange {
    /// Check if the snapshot was replaced
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

#[derive(Debug)]
struct InstanceSettings {
    init: Arc<Settings>,
    runtime: Arc<Settings>,
    revision: u64,
}

/// Per-instance init and runtime settings with change detection
#[derive(Debug, Default)]
pub struct SettingsStore {
    instances: RwLock<HashMap<String, InstanceSettings>>,
}

impl SettingsStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Names are unique across the whole store.
    pub fn insert(
        &self,
        name: impl Into<String>,
        init: Settings,
        runtime: Settings,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        instances.insert(
            name,
            InstanceSettings {
                init: Arc::new(init),
                runtime: Arc::new(runtime),
                revision: 0,
            },
        );
        Ok(())
    }

    /// Check if an instance is registered
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Init settings of an instance
    pub fn init(&self, name: &str) -> Option<Arc<Settings>> {
        self.read().get(name).map(|s| Arc::clone(&s.init))
    }

    /// Current runtime snapshot of an instance
    pub fn runtime(&self, name: &str) -> Option<Arc<Settings>> {
        self.read().get(name).map(|s| Arc::clone(&s.runtime))
    }

    /// Revision of the current runtime snapshot (0 for the initial one)
    pub fn revision(&self, name: &str) -> Option<u64> {
        self.read().get(name).map(|s| s.revision)
    }

    /// Install a complete new runtime snapshot
    ///
    /// Returns `None` for an unknown instance. The snapshot is swapped as a
    /// whole; readers holding the previous `Arc` keep a consistent view.
    pub fn replace_runtime(&self, name: &str, runtime: Settings) -> Option<SettingsChange> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        let entry = instances.get_mut(name)?;
        if *entry.runtime == runtime {
            return Some(SettingsChange::Unchanged);
        }
        entry.runtime = Arc::new(runtime);
        entry.revision += 1;
        Some(SettingsChange::Changed {
            revision: entry.revision,
            settings: Arc::clone(&entry.runtime),
        })
    }

    /// Registered instance names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if no instance is registered
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, InstanceSettings>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }
}
