//! # OEM Gateway - Sensor data relay
//!
//! Collects readings from local sensor sources and relays them to one or
//! more remote destinations, buffering each destination independently so a
//! slow or unreachable endpoint never holds up the others.
//!
//! ## Key Features
//!
//! - **Pluggable listeners**: TCP socket frames, 1-Wire filesystem scans
//! - **Store-and-forward buffers**: bounded FIFO per destination, delivered
//!   in batches, nothing removed until confirmed
//! - **Live settings**: runtime settings and log level reloaded without a
//!   restart
//! - **Status snapshots**: per-instance counters and overall health
//!
//! ## Quick Start
//!
//! ```rust
//! use oemgateway::{
//!     BufferAdapter, Gateway, InstanceConfig, MemoryDestination, Reading, Settings,
//! };
//!
//! let mut gateway = Gateway::new();
//!
//! let memory = MemoryDestination::new();
//! let adapter = BufferAdapter::new("local", &Settings::new(), Box::new(memory)).unwrap();
//! let instance = InstanceConfig::new("local", "memory")
//!     .with_runtime(Settings::new().with("active", true));
//! let local = gateway.add_buffer(&instance, adapter).unwrap();
//!
//! gateway.fan_out(Reading::from_values(10, [21.5, 230.0]).shared());
//! assert_eq!(local.queue_len(), 1);
//! ```
//!
//! ## Modules
//!
//! - [`reading`]: Timestamped sensor readings
//! - [`settings`]: Init and runtime settings, settings store
//! - [`listener`]: Data source contract and built-in listeners
//! - [`buffer`]: Buffer adapter, queue and built-in destinations
//! - [`registry`]: Type name to plugin constructor mapping
//! - [`config`]: Configuration document and sources
//! - [`gateway`]: Instance wiring, fan-out, delivery and reload loops
//! - [`status`]: Status snapshots and health

// Modules
pub mod buffer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod reading;
pub mod registry;
pub mod settings;
pub mod status;

// Re-exports for convenient access
pub use buffer::{
    BufferAdapter, BufferQueue, BufferStats, Destination, EmoncmsDestination, Enqueued,
    FlushOutcome, MemoryDestination, OverflowPolicy, RuntimeOptions, RuntimeSnapshot,
};
pub use config::{
    ConfigSource, FileConfigSource, GatewayDocument, GatewaySection, InstanceConfig,
    InstancePolicy, LogLevel, StaticConfigSource,
};
pub use error::{
    ConfigError, ConstructionError, DeliveryError, GatewayError, ListenerError, QueueFull, Result,
    SettingError,
};
pub use gateway::{Gateway, LogLevelHook, RefreshReport};
pub use listener::{FrameFormat, Listener, OwfsListener, SocketListener};
pub use reading::{Measurement, NodeId, Reading, SharedReading};
pub use registry::{Constructor, PluginInstance, PluginKind, PluginRegistry};
pub use settings::{Settings, SettingsChange, SettingsStore};
pub use status::{BufferStatus, GatewayStatus, HealthStatus, ListenerState, ListenerStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
