// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Buffer abstraction module
//!
//! A [`BufferAdapter`] is the store-and-forward half of the gateway. It owns
//! a bounded FIFO of readings and a [`Destination`] that knows how to ship a
//! batch somewhere. Readings are always queued, whether or not the adapter
//! is active; only delivery is gated by the `active` runtime flag.
//!
//! Generic runtime settings, understood by every adapter:
//!
//! | key          | default | meaning                              |
//! |--------------|---------|--------------------------------------|
//! | `active`     | `false` | whether flushes deliver anything     |
//! | `interval`   | `10`    | seconds between delivery attempts    |
//! | `batch_size` | `250`   | maximum readings per delivery        |
//!
//! Init settings: `max_queue` (default 10000) and `overflow`
//! (`reject` or `drop_oldest`, default `reject`).
//!
//! The remaining runtime keys belong to the destination. A new snapshot is
//! handed to the destination at the start of the next flush, never during
//! one. Every flush reads the `active` flag, the batch size and the
//! destination settings from the same [`RuntimeSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ConstructionError, DeliveryError, QueueFull, SettingError};
use crate::reading::SharedReading;
use crate::settings::Settings;

pub mod emoncms;
pub mod memory;
pub mod queue;

pub use emoncms::EmoncmsDestination;
pub use memory::MemoryDestination;
pub use queue::{Batch, BufferQueue, OverflowPolicy, PushOutcome};

/// Default retention bound
pub const DEFAULT_MAX_QUEUE: usize = 10_000;

/// Default seconds between delivery attempts
pub const DEFAULT_INTERVAL: u64 = 10;

/// Default maximum readings per delivery
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Trait for delivery backends
#[async_trait]
pub trait Destination: Send {
    /// Validate and install the destination-specific runtime settings
    ///
    /// On error the previous settings stay in force.
    fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError>;

    /// Deliver a batch, oldest reading first
    ///
    /// Succeeds only once the destination confirmed the whole batch.
    async fn deliver(&mut self, batch: &[SharedReading]) -> Result<(), DeliveryError>;
}

/// Parsed generic runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Whether flushes deliver
    pub active: bool,
    /// Time between delivery attempts
    pub interval: Duration,
    /// Maximum readings per delivery
    pub batch_size: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            active: false,
            interval: Duration::from_secs(DEFAULT_INTERVAL),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RuntimeOptions {
    /// Read the generic keys of a runtime snapshot
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingError> {
        let active = settings.bool_or("active", false)?;
        let interval = settings.u64_or("interval", DEFAULT_INTERVAL)?;
        if interval == 0 {
            return Err(SettingError::new("interval", "must be at least 1 second"));
        }
        let batch_size = settings.u64_or("batch_size", DEFAULT_BATCH_SIZE as u64)?;
        if batch_size == 0 {
            return Err(SettingError::new("batch_size", "must be at least 1"));
        }
        Ok(Self {
            active,
            interval: Duration::from_secs(interval),
            batch_size: batch_size as usize,
        })
    }
}

/// One validated runtime snapshot
///
/// The generic options are parsed from `settings` once, so a reader never
/// sees options and destination settings from different updates.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSnapshot {
    /// Parsed generic keys
    pub options: RuntimeOptions,
    /// The complete snapshot, destination keys included
    pub settings: Arc<Settings>,
}

impl RuntimeSnapshot {
    /// Validate the generic keys of `settings`
    pub fn new(settings: Arc<Settings>) -> Result<Self, SettingError> {
        let options = RuntimeOptions::from_settings(&settings)?;
        Ok(Self { options, settings })
    }
}

/// Result of one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The adapter is inactive, nothing attempted
    Inactive,
    /// Nothing queued
    Idle,
    /// This many readings were delivered and removed
    Delivered(usize),
}

/// Result of enqueueing a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Queued without loss
    Queued,
    /// Queued after evicting the oldest reading
    EvictedOldest,
}

/// Counters for one adapter
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    /// Readings accepted into the queue
    pub enqueued: u64,
    /// Readings confirmed by the destination
    pub delivered: u64,
    /// Readings lost to the overflow policy
    pub dropped: u64,
    /// Deliveries that failed
    pub failed_flushes: u64,
    /// Time of the last successful delivery
    pub last_delivery: Option<DateTime<Utc>>,
    /// Most recent delivery error, cleared on success
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_flushes: AtomicU64,
    outcome: Mutex<(Option<DateTime<Utc>>, Option<String>)>,
}

struct Backend {
    destination: Box<dyn Destination>,
    applied: Option<Arc<RuntimeSnapshot>>,
    misconfigured: Option<String>,
}

impl Backend {
    /// Hand `snapshot` to the destination if it has not seen it yet
    fn sync_settings(&mut self, name: &str, snapshot: &Arc<RuntimeSnapshot>) {
        if let Some(applied) = &self.applied {
            if Arc::ptr_eq(applied, snapshot) {
                return;
            }
        }
        self.applied = Some(Arc::clone(snapshot));
        match self.destination.apply_runtime_settings(&snapshot.settings) {
            Ok(()) => {
                if self.misconfigured.take().is_some() {
                    info!(instance = %name, "Destination settings accepted");
                }
            }
            Err(e) => {
                warn!(instance = %name, error = %e, "Destination settings rejected, delivery paused");
                self.misconfigured = Some(e.to_string());
            }
        }
    }
}

/// Queue plus destination for one buffer instance
pub struct BufferAdapter {
    name: String,
    queue: Mutex<BufferQueue>,
    runtime: watch::Sender<Arc<RuntimeSnapshot>>,
    backend: tokio::sync::Mutex<Backend>,
    counters: Counters,
}

impl std::fmt::Debug for BufferAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAdapter")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl BufferAdapter {
    /// Wrap a destination, reading retention from the init settings
    ///
    /// The adapter starts inactive with default runtime options until
    /// [`BufferAdapter::update_runtime_settings`] is called.
    pub fn new(
        name: impl Into<String>,
        init: &Settings,
        destination: Box<dyn Destination>,
    ) -> Result<Self, ConstructionError> {
        let name = name.into();
        let err = |e: SettingError| ConstructionError::new(&name, e);

        let max_queue = init.u64_or("max_queue", DEFAULT_MAX_QUEUE as u64).map_err(err)?;
        if max_queue == 0 {
            return Err(err(SettingError::new("max_queue", "must be at least 1")));
        }
        let overflow = init
            .str_or("overflow", "reject")
            .and_then(|p| p.parse::<OverflowPolicy>())
            .map_err(err)?;

        Ok(Self::with_queue(
            name,
            BufferQueue::new(max_queue as usize, overflow),
            destination,
        ))
    }

    /// Wrap a destination with an explicit queue
    pub fn with_queue(
        name: impl Into<String>,
        queue: BufferQueue,
        destination: Box<dyn Destination>,
    ) -> Self {
        let (runtime, _) = watch::channel(Arc::new(RuntimeSnapshot::default()));
        Self {
            name: name.into(),
            queue: Mutex::new(queue),
            runtime,
            backend: tokio::sync::Mutex::new(Backend {
                destination,
                applied: None,
                misconfigured: None,
            }),
            counters: Counters::default(),
        }
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install a complete new runtime snapshot
    ///
    /// Generic keys are validated here and take effect immediately. The
    /// snapshot reaches the destination at the start of the next flush. On
    /// error nothing changes.
    pub fn update_runtime_settings(&self, settings: Arc<Settings>) -> Result<(), SettingError> {
        let snapshot = RuntimeSnapshot::new(settings)?;
        let active = snapshot.options.active;

        let previous = self.runtime.send_replace(Arc::new(snapshot));
        if previous.options.active != active {
            if active {
                info!(instance = %self.name, queued = self.queue_len(), "Buffer activated");
            } else {
                info!(instance = %self.name, queued = self.queue_len(), "Buffer deactivated, readings are kept");
            }
        }
        Ok(())
    }

    /// Watch runtime snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuntimeSnapshot>> {
        self.runtime.subscribe()
    }

    /// Current runtime snapshot
    pub fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        Arc::clone(&self.runtime.borrow())
    }

    /// Current generic runtime options
    pub fn options(&self) -> RuntimeOptions {
        self.runtime.borrow().options.clone()
    }

    /// Time between delivery attempts
    pub fn interval(&self) -> Duration {
        self.runtime.borrow().options.interval
    }

    /// Check if flushes deliver
    pub fn is_active(&self) -> bool {
        self.runtime.borrow().options.active
    }

    /// Queue a reading, applying the overflow policy when full
    ///
    /// Never waits on delivery. The queue lock is held only for the push.
    pub fn enqueue(&self, reading: SharedReading) -> Result<Enqueued, QueueFull> {
        let outcome = self.lock_queue().push(reading);
        match outcome {
            PushOutcome::Queued => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(Enqueued::Queued)
            }
            PushOutcome::Evicted(_) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(Enqueued::EvictedOldest)
            }
            PushOutcome::Rejected(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(QueueFull {
                    buffer: self.name.clone(),
                    capacity: self.capacity(),
                })
            }
        }
    }

    /// Try to deliver the oldest batch
    ///
    /// Flushes of one adapter never overlap. Readings are removed only after
    /// the destination confirmed them; on failure the queue is left exactly
    /// as it was.
    pub async fn flush(&self) -> Result<FlushOutcome, DeliveryError> {
        let mut backend = self.backend.lock().await;
        let snapshot = self.snapshot();
        if !snapshot.options.active {
            return Ok(FlushOutcome::Inactive);
        }

        backend.sync_settings(&self.name, &snapshot);
        if let Some(reason) = &backend.misconfigured {
            let err = DeliveryError::Misconfigured(reason.clone());
            self.record_failure(&err);
            return Err(err);
        }

        let batch = self.lock_queue().peek_batch(snapshot.options.batch_size);
        let Some(batch) = batch else {
            return Ok(FlushOutcome::Idle);
        };

        debug!(instance = %self.name, readings = batch.len(), "Delivering batch");
        match backend.destination.deliver(&batch.readings).await {
            Ok(()) => {
                let retired = self.lock_queue().retire_through(batch.last_id);
                if retired < batch.len() {
                    debug!(instance = %self.name, evicted = batch.len() - retired, "Entries evicted during delivery");
                }
                self.counters
                    .delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                *self.lock_outcome() = (Some(Utc::now()), None);
                Ok(FlushOutcome::Delivered(batch.len()))
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Number of queued readings
    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Retention bound
    pub fn capacity(&self) -> usize {
        self.lock_queue().capacity()
    }

    /// Overflow policy
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.lock_queue().policy()
    }

    /// Copy of the queued readings in FIFO order
    pub fn queued(&self) -> Vec<SharedReading> {
        self.lock_queue().iter().cloned().collect()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> BufferStats {
        let (last_delivery, last_error) = self.lock_outcome().clone();
        BufferStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            last_delivery,
            last_error,
        }
    }

    fn record_failure(&self, err: &DeliveryError) {
        self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
        self.lock_outcome().1 = Some(err.to_string());
    }

    fn lock_queue(&self) -> MutexGuard<'_, BufferQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_outcome(&self) -> MutexGuard<'_, (Option<DateTime<Utc>>, Option<String>)> {
        self.counters.outcome.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use std::sync::atomic::AtomicBool;

    fn reading(node: u32) -> SharedReading {
        Reading::from_values(node, [node as f64, 1.0]).shared()
    }

    fn adapter(init: Settings) -> (BufferAdapter, MemoryDestination) {
        let memory = MemoryDestination::new();
        let adapter = BufferAdapter::new("test", &init, Box::new(memory.clone())).unwrap();
        (adapter, memory)
    }

    fn active() -> Arc<Settings> {
        Arc::new(Settings::new().with("active", true))
    }

    #[test]
    fn test_runtime_options_defaults() {
        let options = RuntimeOptions::from_settings(&Settings::new()).unwrap();
        assert_eq!(options, RuntimeOptions::default());
        assert!(!options.active);
        assert_eq!(options.interval, Duration::from_secs(10));
        assert_eq!(options.batch_size, 250);
    }

    #[test]
    fn test_runtime_options_rejects_zero() {
        assert!(RuntimeOptions::from_settings(&Settings::new().with("interval", 0)).is_err());
        assert!(RuntimeOptions::from_settings(&Settings::new().with("batch_size", 0)).is_err());
        assert!(RuntimeOptions::from_settings(&Settings::new().with("active", "sometimes")).is_err());
    }

    #[test]
    fn test_init_settings_validation() {
        let memory = MemoryDestination::new();
        let result = BufferAdapter::new(
            "bad",
            &Settings::new().with("overflow", "random"),
            Box::new(memory.clone()),
        );
        assert!(result.is_err());

        let result = BufferAdapter::new("bad", &Settings::new().with("max_queue", 0), Box::new(memory));
        assert!(result.is_err());

        let (adapter, _) = adapter(Settings::new().with("max_queue", 3).with("overflow", "drop_oldest"));
        assert_eq!(adapter.capacity(), 3);
        assert_eq!(adapter.overflow_policy(), OverflowPolicy::DropOldest);
    }

    #[tokio::test]
    async fn test_inactive_buffer_keeps_readings() {
        let (adapter, memory) = adapter(Settings::new());
        for n in 1..=5 {
            adapter.enqueue(reading(n)).unwrap();
        }
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Inactive);
        assert_eq!(adapter.queue_len(), 5);
        assert_eq!(memory.attempts(), 0);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_batches() {
        let (adapter, memory) = adapter(Settings::new());
        adapter
            .update_runtime_settings(Arc::new(
                Settings::new().with("active", true).with("batch_size", 2),
            ))
            .unwrap();
        for n in 1..=5 {
            adapter.enqueue(reading(n)).unwrap();
        }

        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Delivered(2));
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Delivered(2));
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Delivered(1));
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Idle);

        let nodes: Vec<_> = memory.delivered().iter().map(|r| r.node()).collect();
        assert_eq!(nodes, vec![1, 2, 3, 4, 5]);
        assert_eq!(adapter.stats().delivered, 5);
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_queue_untouched() {
        let (adapter, memory) = adapter(Settings::new());
        adapter.update_runtime_settings(active()).unwrap();
        for n in 1..=3 {
            adapter.enqueue(reading(n)).unwrap();
        }
        let before = adapter.queued();

        memory.set_failing(true);
        assert!(adapter.flush().await.is_err());
        let after = adapter.queued();
        assert_eq!(before.len(), after.len());
        assert!(before.iter().zip(&after).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert_eq!(adapter.stats().failed_flushes, 1);
        assert!(adapter.stats().last_error.is_some());

        memory.set_failing(false);
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Delivered(3));
        assert!(adapter.stats().last_error.is_none());
    }

    #[tokio::test]
    async fn test_queue_full_rejects_newest() {
        let (adapter, _) = adapter(Settings::new().with("max_queue", 2));
        adapter.enqueue(reading(1)).unwrap();
        adapter.enqueue(reading(2)).unwrap();
        let err = adapter.enqueue(reading(3)).unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!(adapter.stats().dropped, 1);
        let nodes: Vec<_> = adapter.queued().iter().map(|r| r.node()).collect();
        assert_eq!(nodes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_queue_full_drops_oldest() {
        let (adapter, _) = adapter(Settings::new().with("max_queue", 2).with("overflow", "drop_oldest"));
        adapter.enqueue(reading(1)).unwrap();
        adapter.enqueue(reading(2)).unwrap();
        assert_eq!(adapter.enqueue(reading(3)).unwrap(), Enqueued::EvictedOldest);
        let nodes: Vec<_> = adapter.queued().iter().map(|r| r.node()).collect();
        assert_eq!(nodes, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_invalid_runtime_settings_keep_previous() {
        let (adapter, _) = adapter(Settings::new());
        adapter.update_runtime_settings(active()).unwrap();
        let result = adapter.update_runtime_settings(Arc::new(
            Settings::new().with("active", false).with("interval", "soon"),
        ));
        assert!(result.is_err());
        assert!(adapter.is_active());
    }

    #[tokio::test]
    async fn test_rejected_destination_settings_pause_delivery() {
        let (adapter, memory) = adapter(Settings::new());
        adapter
            .update_runtime_settings(Arc::new(
                Settings::new().with("active", true).with("capacity", "lots"),
            ))
            .unwrap();
        adapter.enqueue(reading(1)).unwrap();

        let result = adapter.flush().await;
        assert!(matches!(result, Err(DeliveryError::Misconfigured(_))));
        assert_eq!(adapter.queue_len(), 1);
        assert_eq!(memory.attempts(), 0);

        adapter.update_runtime_settings(active()).unwrap();
        assert_eq!(adapter.flush().await.unwrap(), FlushOutcome::Delivered(1));
    }

    /// Records the `tag` of the settings in force at each delivery
    struct TaggedDestination {
        tag: String,
        delivered_with: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Destination for TaggedDestination {
        fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError> {
            self.tag = settings.str_or("tag", "")?;
            Ok(())
        }

        async fn deliver(&mut self, _batch: &[SharedReading]) -> Result<(), DeliveryError> {
            self.delivered_with.lock().unwrap().push(self.tag.clone());
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_is_read_once() {
        let (adapter, _) = adapter(Settings::new());
        let settings = Arc::new(Settings::new().with("active", true).with("batch_size", 7));
        adapter.update_runtime_settings(Arc::clone(&settings)).unwrap();

        let snapshot = adapter.snapshot();
        assert!(Arc::ptr_eq(&snapshot.settings, &settings));
        assert_eq!(snapshot.options.batch_size, 7);
        assert!(adapter.is_active());

        assert!(adapter
            .update_runtime_settings(Arc::new(Settings::new().with("batch_size", 0)))
            .is_err());
        assert!(Arc::ptr_eq(&adapter.snapshot(), &snapshot));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deactivating_update_never_delivers_with_its_settings() {
        let delivered_with = Arc::new(Mutex::new(Vec::new()));
        let destination = TaggedDestination {
            tag: String::new(),
            delivered_with: Arc::clone(&delivered_with),
        };
        let adapter = Arc::new(
            BufferAdapter::new("tagged", &Settings::new(), Box::new(destination)).unwrap(),
        );
        let on = Arc::new(Settings::new().with("active", true).with("tag", "on"));
        let off = Arc::new(Settings::new().with("active", false).with("tag", "off"));
        adapter.update_runtime_settings(Arc::clone(&on)).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let toggler = {
            let adapter = Arc::clone(&adapter);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    adapter.update_runtime_settings(Arc::clone(&off)).unwrap();
                    adapter.update_runtime_settings(Arc::clone(&on)).unwrap();
                }
            })
        };

        for n in 0..2000 {
            adapter.enqueue(reading(n)).unwrap();
            adapter.flush().await.unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        toggler.join().unwrap();

        let tags = delivered_with.lock().unwrap();
        assert!(!tags.is_empty());
        assert!(tags.iter().all(|tag| tag == "on"));
    }
}
