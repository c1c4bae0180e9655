// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Plugin registry
//!
//! Maps a type name from the configuration (`"socket"`, `"emoncms"`, ...) to
//! a constructor. Listener constructors build a [`Listener`]; destination
//! constructors build a [`Destination`] which the registry wraps into a
//! [`BufferAdapter`] so every buffer gets the same queueing behaviour.

use std::collections::HashMap;

use crate::buffer::{BufferAdapter, Destination, EmoncmsDestination, MemoryDestination};
use crate::error::{ConfigError, ConstructionError, GatewayError, Result};
use crate::listener::{Listener, OwfsListener, SocketListener};
use crate::settings::Settings;

/// Builds a listener from its instance name and init settings
pub type ListenerFactory =
    Box<dyn Fn(&str, &Settings) -> std::result::Result<Box<dyn Listener>, ConstructionError> + Send + Sync>;

/// Builds a destination from its instance name and init settings
pub type DestinationFactory =
    Box<dyn Fn(&str, &Settings) -> std::result::Result<Box<dyn Destination>, ConstructionError> + Send + Sync>;

/// Which side of the gateway a plugin type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Data source
    Listener,
    /// Store-and-forward destination
    Buffer,
}

impl PluginKind {
    /// Lowercase name used in messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Buffer => "buffer",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered constructor
pub enum Constructor {
    /// Listener factory
    Listener(ListenerFactory),
    /// Destination factory
    Buffer(DestinationFactory),
}

impl Constructor {
    /// Wrap a listener factory
    pub fn listener<F, L>(factory: F) -> Self
    where
        F: Fn(&str, &Settings) -> std::result::Result<L, ConstructionError> + Send + Sync + 'static,
        L: Listener + 'static,
    {
        Self::Listener(Box::new(move |name, init| {
            factory(name, init).map(|l| Box::new(l) as Box<dyn Listener>)
        }))
    }

    /// Wrap a destination factory
    pub fn buffer<F, D>(factory: F) -> Self
    where
        F: Fn(&str, &Settings) -> std::result::Result<D, ConstructionError> + Send + Sync + 'static,
        D: Destination + 'static,
    {
        Self::Buffer(Box::new(move |name, init| {
            factory(name, init).map(|d| Box::new(d) as Box<dyn Destination>)
        }))
    }

    /// Kind of plugin this constructor builds
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Listener(_) => PluginKind::Listener,
            Self::Buffer(_) => PluginKind::Buffer,
        }
    }
}

impl std::fmt::Debug for Constructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Constructor({})", self.kind())
    }
}

/// A freshly constructed plugin instance
pub enum PluginInstance {
    /// Listener, not yet running
    Listener(Box<dyn Listener>),
    /// Buffer adapter with an empty queue, inactive
    Buffer(BufferAdapter),
}

impl PluginInstance {
    /// Kind of the instance
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Listener(_) => PluginKind::Listener,
            Self::Buffer(_) => PluginKind::Buffer,
        }
    }
}

/// Type name to constructor mapping
#[derive(Debug, Default)]
pub struct PluginRegistry {
    constructors: HashMap<String, Constructor>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in plugins
    ///
    /// | type      | kind     |
    /// |-----------|----------|
    /// | `socket`  | listener |
    /// | `owfs`    | listener |
    /// | `emoncms` | buffer   |
    /// | `memory`  | buffer   |
    pub fn with_builtins() -> Self {
        let mut constructors = HashMap::new();
        constructors.insert(
            "socket".to_string(),
            Constructor::listener(SocketListener::from_settings),
        );
        constructors.insert(
            "owfs".to_string(),
            Constructor::listener(OwfsListener::from_settings),
        );
        constructors.insert(
            "emoncms".to_string(),
            Constructor::buffer(EmoncmsDestination::from_settings),
        );
        constructors.insert(
            "memory".to_string(),
            Constructor::buffer(|_: &str, _: &Settings| Ok(MemoryDestination::new())),
        );
        Self { constructors }
    }

    /// Register a constructor under a type name
    ///
    /// Fails if the name is taken; the existing constructor is kept.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        constructor: Constructor,
    ) -> std::result::Result<(), ConfigError> {
        let type_name = type_name.into();
        if self.constructors.contains_key(&type_name) {
            return Err(ConfigError::TypeAlreadyRegistered(type_name));
        }
        self.constructors.insert(type_name, constructor);
        Ok(())
    }

    /// Kind of a registered type
    pub fn kind(&self, type_name: &str) -> Option<PluginKind> {
        self.constructors.get(type_name).map(Constructor::kind)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build an instance from its type name and init settings
    pub fn instantiate(&self, type_name: &str, name: &str, init: &Settings) -> Result<PluginInstance> {
        let constructor = self.constructors.get(type_name).ok_or_else(|| ConfigError::UnknownType {
            instance: name.to_string(),
            type_name: type_name.to_string(),
        })?;

        match constructor {
            Constructor::Listener(factory) => Ok(PluginInstance::Listener(factory(name, init)?)),
            Constructor::Buffer(factory) => {
                let destination = factory(name, init)?;
                let adapter = BufferAdapter::new(name, init, destination)?;
                Ok(PluginInstance::Buffer(adapter))
            }
        }
    }

    /// Build an instance that must be of the given kind
    pub fn instantiate_kind(
        &self,
        kind: PluginKind,
        type_name: &str,
        name: &str,
        init: &Settings,
    ) -> Result<PluginInstance> {
        if let Some(actual) = self.kind(type_name) {
            if actual != kind {
                return Err(GatewayError::Config(ConfigError::WrongKind {
                    instance: name.to_string(),
                    type_name: type_name.to_string(),
                    expected: kind.as_str(),
                }));
            }
        }
        self.instantiate(type_name, name, init)
    }
}
