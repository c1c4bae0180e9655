//! Status snapshots for OEM Gateway
//!
//! Listener runners update a shared [`ListenerStats`] as they go; buffer
//! adapters keep their own counters. [`GatewayStatus`] folds both into one
//! serialisable snapshot with an overall [`HealthStatus`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::buffer::BufferStats;

/// Health status of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HealthStatus {
    /// Every listener running, every active buffer delivering
    Healthy,
    /// Still relaying, but a listener stopped or a delivery is failing
    Degraded,
    /// No listener is running
    Unhealthy,
    /// Nothing configured
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Check if the status is operational (healthy or degraded)
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Check if the status is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Lifecycle state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ListenerState {
    /// Registered, gateway not running yet
    #[default]
    Pending,
    /// Acquiring readings
    Running,
    /// Ended after an unrecoverable error or shutdown
    Stopped,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Stopped => 2,
        }
    }
}

/// Live counters of one listener, shared with its runner
#[derive(Debug, Default)]
pub struct ListenerStats {
    state: AtomicU8,
    readings: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ListenerStats {
    /// Create zeroed counters in the `Pending` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to a new state
    pub fn set_state(&self, state: ListenerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Count a produced reading
    pub fn record_reading(&self) {
        self.readings.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an acquisition error
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Readings produced so far
    pub fn readings(&self) -> u64 {
        self.readings.load(Ordering::Relaxed)
    }

    /// Acquisition errors so far
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Snapshot for the named listener
    pub fn snapshot(&self, name: &str, type_name: &str) -> ListenerStatus {
        ListenerStatus {
            name: name.to_string(),
            type_name: type_name.to_string(),
            state: self.state(),
            readings: self.readings(),
            acquisition_errors: self.errors(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Status of one listener
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    /// Instance name
    pub name: String,
    /// Plugin type
    #[serde(rename = "type")]
    pub type_name: String,
    /// Lifecycle state
    pub state: ListenerState,
    /// Readings produced
    pub readings: u64,
    /// Failed acquisition attempts
    pub acquisition_errors: u64,
    /// Most recent acquisition error
    pub last_error: Option<String>,
}

/// Status of one buffer
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    /// Instance name
    pub name: String,
    /// Plugin type
    #[serde(rename = "type")]
    pub type_name: String,
    /// Delivery enabled
    pub active: bool,
    /// Readings waiting for delivery
    pub queued: usize,
    /// Retention bound
    pub capacity: usize,
    /// Counters
    #[serde(flatten)]
    pub stats: BufferStats,
}

/// Snapshot of the whole gateway
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Overall health
    pub health: HealthStatus,
    /// Seconds since the gateway was built
    pub uptime_secs: u64,
    /// Listener states
    pub listeners: Vec<ListenerStatus>,
    /// Buffer states
    pub buffers: Vec<BufferStatus>,
}

impl GatewayStatus {
    /// Assemble a snapshot and derive its health
    pub fn new(uptime_secs: u64, listeners: Vec<ListenerStatus>, buffers: Vec<BufferStatus>) -> Self {
        let health = Self::evaluate(&listeners, &buffers);
        Self {
            health,
            uptime_secs,
            listeners,
            buffers,
        }
    }

    fn evaluate(listeners: &[ListenerStatus], buffers: &[BufferStatus]) -> HealthStatus {
        if listeners.is_empty() && buffers.is_empty() {
            return HealthStatus::Unknown;
        }

        let stopped = listeners
            .iter()
            .filter(|l| l.state == ListenerState::Stopped)
            .count();
        if !listeners.is_empty() && stopped == listeners.len() {
            return HealthStatus::Unhealthy;
        }

        let failing = buffers
            .iter()
            .any(|b| b.active && b.stats.last_error.is_some());
        if stopped > 0 || failing {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Total readings waiting across all buffers
    pub fn total_queued(&self) -> usize {
        self.buffers.iter().map(|b| b.queued).sum()
    }

    /// Generate a text report
    pub fn report(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("Gateway Status: {:?}\n\n", self.health));

        for l in &self.listeners {
            report.push_str(&format!(
                "[listener] {} ({}) {:?} readings={} errors={}\n",
                l.name, l.type_name, l.state, l.readings, l.acquisition_errors
            ));
        }
        for b in &self.buffers {
            report.push_str(&format!(
                "[buffer] {} ({}) active={} queued={}/{} delivered={} dropped={}\n",
                b.name, b.type_name, b.active, b.queued, b.capacity, b.stats.delivered, b.stats.dropped
            ));
        }

        report
    }
}
