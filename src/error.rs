//! Error types for OEM Gateway
//!
//! This module defines all error types used throughout the library. The
//! top-level [`GatewayError`] folds the per-concern errors together so the
//! gateway core can log any of them uniformly.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for gateway operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A plugin constructor rejected its init settings
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    /// Listener error
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Delivery error
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Buffer queue reached its retention bound
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
}

/// Errors found while reading or applying configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Two instances share a name
    #[error("Duplicate instance name: {0}")]
    DuplicateName(String),

    /// No constructor registered for a type name
    #[error("Unknown plugin type '{type_name}' for instance '{instance}'")]
    UnknownType { instance: String, type_name: String },

    /// The type exists but builds the other kind of plugin
    #[error("Plugin type '{type_name}' of instance '{instance}' is not a {expected}")]
    WrongKind {
        instance: String,
        type_name: String,
        expected: &'static str,
    },

    /// An instance entry lacks `init_settings` or `runtime_settings`
    #[error("Instance '{instance}' is missing the '{key}' section")]
    MissingSettings { instance: String, key: &'static str },

    /// A setting has the wrong shape
    #[error(transparent)]
    InvalidSetting(#[from] SettingError),

    /// The configuration document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration document could not be read
    #[error("Failed to read configuration {path}: {reason}")]
    Io { path: String, reason: String },

    /// A plugin type name was registered twice
    #[error("Plugin type already registered: {0}")]
    TypeAlreadyRegistered(String),
}

/// A single setting is missing or malformed
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid setting '{key}': {reason}")]
pub struct SettingError {
    /// Setting key
    pub key: String,
    /// What is wrong with it
    pub reason: String,
}

impl SettingError {
    /// Create a setting error
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// A plugin constructor rejected its init settings
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot construct '{instance}': {reason}")]
pub struct ConstructionError {
    /// Instance name
    pub instance: String,
    /// Why construction failed
    pub reason: String,
}

impl ConstructionError {
    /// Create a construction error for the named instance
    pub fn new(instance: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            instance: instance.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while a listener acquires data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ListenerError {
    /// One acquisition attempt failed; the listener keeps going
    #[error("Acquisition failed: {0}")]
    Acquisition(String),

    /// The origin is permanently gone; the listener stops
    #[error("Source unavailable: {0}")]
    Unrecoverable(String),
}

impl ListenerError {
    /// Check if the listener can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Acquisition(_))
    }
}

/// Errors raised while a buffer delivers a batch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Destination unreachable or connection failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Destination answered but did not accept the batch
    #[error("Destination rejected batch: {0}")]
    Rejected(String),

    /// Runtime settings are not usable for delivery
    #[error("Destination misconfigured: {0}")]
    Misconfigured(String),
}

/// The buffer queue reached its retention bound
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Queue full for buffer '{buffer}' ({capacity} entries)")]
pub struct QueueFull {
    /// Buffer instance name
    pub buffer: String,
    /// Configured retention bound
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Config(ConfigError::UnknownType {
            instance: "local".to_string(),
            type_name: "nope".to_string(),
        });
        let msg = format!("{}", err);
        assert!(msg.contains("nope"));
        assert!(msg.contains("local"));
    }

    #[test]
    fn test_error_conversion() {
        let err: GatewayError = QueueFull {
            buffer: "remote".to_string(),
            capacity: 5,
        }
        .into();
        assert!(matches!(err, GatewayError::QueueFull(_)));
        assert_eq!(err.to_string(), "Queue full for buffer 'remote' (5 entries)");
    }

    #[test]
    fn test_listener_error_recoverable() {
        assert!(ListenerError::Acquisition("bad frame".into()).is_recoverable());
        assert!(!ListenerError::Unrecoverable("gone".into()).is_recoverable());
    }

    #[test]
    fn test_setting_error_into_config_error() {
        let err: ConfigError = SettingError::new("port", "not a number").into();
        assert_eq!(err.to_string(), "Invalid setting 'port': not a number");
    }
}
