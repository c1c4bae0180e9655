// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sensor readings
//!
//! A [`Reading`] is one timestamped observation from one source node. It is
//! immutable once built: fields are private and only exposed through
//! getters. The gateway shares a single allocation between every buffer
//! through [`SharedReading`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifier of the node a reading was captured from
pub type NodeId = u32;

/// A reading shared between buffer queues without copying
pub type SharedReading = Arc<Reading>;

/// One named value inside a reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Measurement name (sensor key or positional index)
    pub name: String,
    /// Value, `None` for a placeholder or an unreadable sensor
    pub value: Option<f64>,
}

impl Measurement {
    /// Create a measurement with a value
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
        }
    }

    /// Create a measurement slot without a value
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// One timestamped observation from one source node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    node: NodeId,
    values: Vec<Measurement>,
    timestamp: DateTime<Utc>,
    sequence: Option<u64>,
}

impl Reading {
    /// Create a reading captured now
    pub fn new(node: NodeId, values: Vec<Measurement>) -> Self {
        Self::at(node, values, Utc::now())
    }

    /// Create a reading with an explicit capture time
    pub fn at(node: NodeId, values: Vec<Measurement>, timestamp: DateTime<Utc>) -> Self {
        Self {
            node,
            values,
            timestamp,
            sequence: None,
        }
    }

    /// Create a reading from positional values named "1", "2", ...
    pub fn from_values(node: NodeId, values: impl IntoIterator<Item = f64>) -> Self {
        let values = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Measurement::new((i + 1).to_string(), v))
            .collect();
        Self::new(node, values)
    }

    /// Attach a per-source sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Source node
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Measurements in source order
    pub fn values(&self) -> &[Measurement] {
        &self.values
    }

    /// Capture time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Per-source sequence number, if the listener assigns one
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Look up a measurement value by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.value)
    }

    /// Wrap into a shared handle for fan-out
    pub fn shared(self) -> SharedReading {
        Arc::new(self)
    }
}
