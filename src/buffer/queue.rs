// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded FIFO of not-yet-delivered readings
//!
//! Every entry gets a monotonically increasing id when queued. Deliveries
//! peek a batch from the front, and once confirmed retire everything up to
//! the batch's last id. Entries evicted by the overflow policy while a
//! delivery is in flight are simply no longer there to retire.

use std::collections::VecDeque;
use std::str::FromStr;

use crate::error::SettingError;
use crate::reading::SharedReading;

/// What happens when a reading arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the incoming reading (drop newest)
    #[default]
    Reject,
    /// Evict the oldest queued reading to make room
    DropOldest,
}

impl OverflowPolicy {
    /// Settings value naming this policy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::DropOldest => "drop_oldest",
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = SettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" | "drop_newest" => Ok(Self::Reject),
            "drop_oldest" => Ok(Self::DropOldest),
            other => Err(SettingError::new(
                "overflow",
                format!("unknown overflow policy '{}' (expected reject or drop_oldest)", other),
            )),
        }
    }
}

/// Result of pushing a reading
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Queued, nothing lost
    Queued,
    /// Queued after evicting the returned oldest reading
    Evicted(SharedReading),
    /// Not queued, the queue is full
    Rejected(SharedReading),
}

/// A contiguous run of the oldest queued readings
#[derive(Debug, Clone)]
pub struct Batch {
    /// Readings in queue order
    pub readings: Vec<SharedReading>,
    /// Id of the first reading
    pub first_id: u64,
    /// Id of the last reading
    pub last_id: u64,
}

impl Batch {
    /// Number of readings in the batch
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    reading: SharedReading,
}

/// Bounded FIFO owned by one buffer adapter
#[derive(Debug)]
pub struct BufferQueue {
    entries: VecDeque<Entry>,
    capacity: usize,
    policy: OverflowPolicy,
    next_id: u64,
}

impl BufferQueue {
    /// Create a queue holding at most `capacity` readings (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
            next_id: 0,
        }
    }

    /// Append a reading, applying the overflow policy when full
    pub fn push(&mut self, reading: SharedReading) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;

        if self.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => return PushOutcome::Rejected(reading),
                OverflowPolicy::DropOldest => {
                    if let Some(oldest) = self.entries.pop_front() {
                        outcome = PushOutcome::Evicted(oldest.reading);
                    }
                }
            }
        }

        self.next_id += 1;
        self.entries.push_back(Entry {
            id: self.next_id,
            reading,
        });
        outcome
    }

    /// Copy out up to `max` of the oldest readings without removing them
    pub fn peek_batch(&self, max: usize) -> Option<Batch> {
        let first = self.entries.front()?;
        let readings: Vec<_> = self
            .entries
            .iter()
            .take(max.max(1))
            .map(|e| SharedReading::clone(&e.reading))
            .collect();
        let last_id = first.id + readings.len() as u64 - 1;
        Some(Batch {
            readings,
            first_id: first.id,
            last_id,
        })
    }

    /// Remove every entry with an id up to and including `last_id`
    ///
    /// Returns how many entries were removed.
    pub fn retire_through(&mut self, last_id: u64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|e| e.id <= last_id) {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Queued readings in FIFO order
    pub fn iter(&self) -> impl Iterator<Item = &SharedReading> {
        self.entries.iter().map(|e| &e.reading)
    }

    /// Number of queued readings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retention bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
