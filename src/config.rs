// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for OEM Gateway
//!
//! The configuration document names every listener and buffer instance with
//! its plugin type and two settings sections:
//!
//! ```json
//! {
//!   "gateway": { "loglevel": "INFO", "reload_interval": 10 },
//!   "listeners": [
//!     { "name": "owfs", "type": "owfs",
//!       "init_settings": { "path": "/mnt/1wire" },
//!       "runtime_settings": { "sensor1": "28.AB12" } }
//!   ],
//!   "buffers": [
//!     { "name": "local", "type": "emoncms",
//!       "init_settings": {},
//!       "runtime_settings": { "active": true, "domain": "127.0.0.1", "apikey": "..." } }
//!   ]
//! }
//! ```
//!
//! A [`ConfigSource`] hands out a fresh document on every call so the
//! gateway can poll it for runtime changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::Settings;

/// Default seconds between configuration reloads
pub const DEFAULT_RELOAD_INTERVAL: u64 = 10;

/// Default capacity of the listener to fan-out channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default seconds to wait for running tasks after shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 10;

/// Gateway log level as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    /// Everything
    Debug,
    /// Normal operation
    #[default]
    Info,
    /// Recoverable problems
    Warning,
    /// Failures
    Error,
    /// Same filter as `Error`
    Critical,
}

impl LogLevel {
    /// Name as written in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// `tracing` filter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(ConfigError::Parse(format!("unknown log level '{}'", other))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, ConfigError> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

/// What to do at startup when an instance cannot be built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePolicy {
    /// Log the error and start without the instance
    #[default]
    Skip,
    /// Refuse to start
    Abort,
}

/// Gateway-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Log level, applied live on reload
    pub loglevel: LogLevel,

    /// Seconds between configuration reloads
    pub reload_interval: u64,

    /// Startup policy for invalid instances
    pub on_invalid_instance: InstancePolicy,

    /// Readings buffered between listeners and the fan-out
    pub channel_capacity: usize,

    /// Seconds to wait for tasks to finish once shutdown is requested
    pub shutdown_timeout: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            loglevel: LogLevel::Info,
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            on_invalid_instance: InstancePolicy::Skip,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// One listener or buffer entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,

    /// Registered plugin type
    #[serde(rename = "type")]
    pub type_name: String,

    /// Construction-time settings
    #[serde(default)]
    pub init_settings: Option<Settings>,

    /// Live-updatable settings
    #[serde(default)]
    pub runtime_settings: Option<Settings>,
}

impl InstanceConfig {
    /// Create an entry with empty settings sections
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            init_settings: Some(Settings::new()),
            runtime_settings: Some(Settings::new()),
        }
    }

    /// Replace the init settings
    pub fn with_init(mut self, init: Settings) -> Self {
        self.init_settings = Some(init);
        self
    }

    /// Replace the runtime settings
    pub fn with_runtime(mut self, runtime: Settings) -> Self {
        self.runtime_settings = Some(runtime);
        self
    }

    /// Init settings, required
    pub fn init(&self) -> Result<&Settings, ConfigError> {
        self.init_settings
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSettings {
                instance: self.name.clone(),
                key: "init_settings",
            })
    }

    /// Runtime settings, required
    pub fn runtime(&self) -> Result<&Settings, ConfigError> {
        self.runtime_settings
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSettings {
                instance: self.name.clone(),
                key: "runtime_settings",
            })
    }
}

/// A complete configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayDocument {
    /// Gateway-level settings
    pub gateway: GatewaySection,

    /// Listener instances
    pub listeners: Vec<InstanceConfig>,

    /// Buffer instances
    pub buffers: Vec<InstanceConfig>,
}

impl GatewayDocument {
    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Add a listener entry
    pub fn with_listener(mut self, instance: InstanceConfig) -> Self {
        self.listeners.push(instance);
        self
    }

    /// Add a buffer entry
    pub fn with_buffer(mut self, instance: InstanceConfig) -> Self {
        self.buffers.push(instance);
        self
    }

    /// Look up an entry by name in both sections
    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.listeners
            .iter()
            .chain(self.buffers.iter())
            .find(|i| i.name == name)
    }
}

/// Supplier of configuration documents
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Produce the current document
    async fn load(&self) -> Result<GatewayDocument, ConfigError>;

    /// Human-readable origin for log records
    fn describe(&self) -> String;
}

/// JSON file re-read on every load
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Read from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<GatewayDocument, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::Io {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        GatewayDocument::from_json(&text)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process document, replaced through [`StaticConfigSource::set`]
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    document: RwLock<GatewayDocument>,
}

impl StaticConfigSource {
    /// Serve `document` until replaced
    pub fn new(document: GatewayDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Replace the served document
    pub fn set(&self, document: GatewayDocument) {
        *self.document.write().unwrap_or_else(|e| e.into_inner()) = document;
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<GatewayDocument, ConfigError> {
        Ok(self.document.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn describe(&self) -> String {
        "in-memory document".to_string()
    }
}
