// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-memory destination
//!
//! Keeps the most recently delivered readings in process. Useful for local
//! inspection and for exercising buffer behaviour without a network.
//! Clones share the same store, so a handle kept outside the adapter sees
//! everything delivered through it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::Destination;
use crate::error::{DeliveryError, SettingError};
use crate::reading::SharedReading;
use crate::settings::Settings;

/// Default number of delivered readings kept
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
struct MemoryState {
    delivered: VecDeque<SharedReading>,
    capacity: usize,
    failing: bool,
    attempts: u64,
    batches: u64,
}

/// Destination storing delivered readings in memory
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    /// Create a destination keeping the default number of readings
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a destination keeping at most `capacity` readings
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                delivered: VecDeque::new(),
                capacity: capacity.max(1),
                failing: false,
                attempts: 0,
                batches: 0,
            })),
        }
    }

    /// Make every following delivery fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Delivered readings, oldest first
    pub fn delivered(&self) -> Vec<SharedReading> {
        self.lock().delivered.iter().cloned().collect()
    }

    /// Number of readings currently kept
    pub fn len(&self) -> usize {
        self.lock().delivered.len()
    }

    /// Check if nothing was kept
    pub fn is_empty(&self) -> bool {
        self.lock().delivered.is_empty()
    }

    /// Delivery attempts, failed ones included
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    /// Successfully delivered batches
    pub fn batches(&self) -> u64 {
        self.lock().batches
    }

    /// Forget delivered readings
    pub fn clear(&self) {
        self.lock().delivered.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError> {
        let capacity = settings.get_u64("capacity")?;
        if capacity == Some(0) {
            return Err(SettingError::new("capacity", "must be at least 1"));
        }

        let mut state = self.lock();
        if let Some(capacity) = capacity {
            state.capacity = capacity as usize;
        }
        while state.delivered.len() > state.capacity {
            state.delivered.pop_front();
        }
        Ok(())
    }

    async fn deliver(&mut self, batch: &[SharedReading]) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.failing {
            return Err(DeliveryError::Transport("memory destination is failing".to_string()));
        }

        state.delivered.extend(batch.iter().cloned());
        while state.delivered.len() > state.capacity {
            state.delivered.pop_front();
        }
        state.batches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;

    fn batch(nodes: &[u32]) -> Vec<SharedReading> {
        nodes
            .iter()
            .map(|n| Reading::from_values(*n, [1.0]).shared())
            .collect()
    }

    #[tokio::test]
    async fn test_memory_destination_keeps_delivered() {
        let mut destination = MemoryDestination::new();
        let handle = destination.clone();
        destination.deliver(&batch(&[1, 2])).await.unwrap();
        destination.deliver(&batch(&[3])).await.unwrap();

        let nodes: Vec<_> = handle.delivered().iter().map(|r| r.node()).collect();
        assert_eq!(nodes, vec![1, 2, 3]);
        assert_eq!(handle.batches(), 2);
    }

    #[tokio::test]
    async fn test_memory_destination_capacity() {
        let mut destination = MemoryDestination::with_capacity(2);
        destination.deliver(&batch(&[1, 2, 3])).await.unwrap();
        let nodes: Vec<_> = destination.delivered().iter().map(|r| r.node()).collect();
        assert_eq!(nodes, vec![2, 3]);

        destination
            .apply_runtime_settings(&Settings::new().with("capacity", 1))
            .unwrap();
        assert_eq!(destination.len(), 1);
        assert!(destination
            .apply_runtime_settings(&Settings::new().with("capacity", 0))
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_destination_failing() {
        let mut destination = MemoryDestination::new();
        destination.set_failing(true);
        let result = destination.deliver(&batch(&[1])).await;
        assert!(matches!(result, Err(DeliveryError::Transport(_))));
        assert!(destination.is_empty());
        assert_eq!(destination.attempts(), 1);
        assert_eq!(destination.batches(), 0);
    }
}
