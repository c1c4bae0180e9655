// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! High-level Gateway API
//!
//! The [`Gateway`] owns every listener and buffer instance and wires them
//! together when [`Gateway::run`] is called:
//!
//! ```text
//!  listener task ─┐
//!  listener task ─┼─ mpsc ─▶ fan-out task ─▶ enqueue on every BufferAdapter
//!  listener task ─┘                              │
//!                                delivery task ◀─┘ (one per adapter)
//! ```
//!
//! Runtime settings reach the instances through `watch` channels, so a
//! settings refresh never waits on a listener that is blocked reading or an
//! adapter that is blocked delivering.
//!
//! # Example
//!
//! ```rust,no_run
//! use oemgateway::{Gateway, GatewayDocument, PluginRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(text: &str) -> oemgateway::Result<()> {
//! let document = GatewayDocument::from_json(text)?;
//! let gateway = Gateway::from_config(&PluginRegistry::with_builtins(), &document)?;
//!
//! let shutdown = CancellationToken::new();
//! gateway.run(shutdown.clone()).await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferAdapter, Enqueued, FlushOutcome};
use crate::config::{ConfigSource, GatewayDocument, GatewaySection, InstanceConfig, InstancePolicy, LogLevel};
use crate::error::{ConfigError, GatewayError, Result};
use crate::listener::Listener;
use crate::reading::SharedReading;
use crate::registry::{PluginInstance, PluginKind, PluginRegistry};
use crate::settings::{Settings, SettingsChange, SettingsStore};
use crate::status::{BufferStatus, GatewayStatus, ListenerState, ListenerStats};

/// Callback receiving log level changes
pub type LogLevelHook = Box<dyn Fn(LogLevel) + Send + Sync>;

/// Outcome of handing new runtime settings to one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// Accepted and recorded
    Changed,
    /// Sent to a running listener, which applies it before its next read
    Published,
    /// Refused, previous settings stay in force
    Rejected,
    /// Already published and not refused yet
    Pending,
}

struct ListenerSlot {
    name: String,
    type_name: String,
    /// `None` once the runner took the listener
    listener: Mutex<Option<Box<dyn Listener>>>,
    settings: watch::Sender<Arc<Settings>>,
    /// Last snapshot the running listener refused
    rejected: Arc<Mutex<Option<Arc<Settings>>>>,
    stats: Arc<ListenerStats>,
}

impl ListenerSlot {
    /// Take the listener along with a feed that has seen every snapshot
    /// applied so far
    fn start(&self, store: &Arc<SettingsStore>) -> Option<(Box<dyn Listener>, SettingsFeed)> {
        let mut idle = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        let listener = idle.take()?;
        let feed = SettingsFeed {
            name: self.name.clone(),
            receiver: self.settings.subscribe(),
            store: Arc::clone(store),
            rejected: Arc::clone(&self.rejected),
        };
        Some((listener, feed))
    }

    fn apply(&self, store: &SettingsStore, runtime: &Settings) -> Applied {
        let mut idle = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listener) = idle.as_mut() {
            return match listener.apply_runtime_settings(runtime) {
                Ok(()) => {
                    if let Some(SettingsChange::Changed { revision, settings }) =
                        store.replace_runtime(&self.name, runtime.clone())
                    {
                        debug!(instance = %self.name, revision, "Runtime settings applied");
                        self.settings.send_replace(settings);
                    }
                    Applied::Changed
                }
                Err(e) => {
                    warn!(instance = %self.name, error = %e, "Runtime settings rejected, keeping previous");
                    Applied::Rejected
                }
            };
        }
        drop(idle);

        if **self.settings.borrow() == *runtime {
            let last_refused = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
            return match last_refused.as_deref() {
                Some(refused) if refused == runtime => Applied::Rejected,
                _ => Applied::Pending,
            };
        }
        debug!(instance = %self.name, "Publishing runtime settings");
        self.settings.send_replace(Arc::new(runtime.clone()));
        Applied::Published
    }
}

/// Runtime settings side of one running listener
struct SettingsFeed {
    name: String,
    receiver: watch::Receiver<Arc<Settings>>,
    store: Arc<SettingsStore>,
    rejected: Arc<Mutex<Option<Arc<Settings>>>>,
}

impl SettingsFeed {
    /// Apply the latest published snapshot, recording the outcome
    fn apply_latest(&mut self, listener: &mut dyn Listener) {
        let snapshot: Arc<Settings> = self.receiver.borrow_and_update().clone();
        let mut rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
        match listener.apply_runtime_settings(&snapshot) {
            Ok(()) => {
                *rejected = None;
                if let Some(SettingsChange::Changed { revision, .. }) =
                    self.store.replace_runtime(&self.name, (*snapshot).clone())
                {
                    debug!(instance = %self.name, revision, "Runtime settings applied");
                }
            }
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Runtime settings rejected, keeping previous");
                *rejected = Some(snapshot);
            }
        }
    }
}

struct BufferSlot {
    type_name: String,
    adapter: Arc<BufferAdapter>,
}

/// What a settings refresh did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    /// Instances that accepted a new runtime snapshot
    pub changed: Vec<String>,
    /// Running listeners handed a new snapshot, applied before their next read
    pub published: Vec<String>,
    /// Instances whose new snapshot was refused
    pub rejected: Vec<String>,
    /// Instances with changes that only a restart applies
    pub restart_required: Vec<String>,
    /// New log level, if it changed
    pub log_level: Option<LogLevel>,
}

/// Sensor data relay
pub struct Gateway {
    section: GatewaySection,
    store: Arc<SettingsStore>,
    listeners: Vec<ListenerSlot>,
    buffers: Vec<BufferSlot>,
    skipped: Vec<GatewayError>,
    log_level: Mutex<LogLevel>,
    log_hook: Option<LogLevelHook>,
    source: Option<Arc<dyn ConfigSource>>,
    started: std::time::Instant,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    /// Create an empty gateway with default settings
    pub fn new() -> Self {
        Self::with_section(GatewaySection::default())
    }

    /// Create an empty gateway with the given gateway-level settings
    pub fn with_section(section: GatewaySection) -> Self {
        Self {
            log_level: Mutex::new(section.loglevel),
            section,
            store: Arc::new(SettingsStore::new()),
            listeners: Vec::new(),
            buffers: Vec::new(),
            skipped: Vec::new(),
            log_hook: None,
            source: None,
            started: std::time::Instant::now(),
        }
    }

    /// Build every instance of a configuration document
    ///
    /// Invalid instances are handled according to
    /// `gateway.on_invalid_instance`: skipped with an error record, or
    /// returned as the error of this call.
    pub fn from_config(registry: &PluginRegistry, document: &GatewayDocument) -> Result<Self> {
        let mut gateway = Self::with_section(document.gateway.clone());
        let policy = document.gateway.on_invalid_instance;

        let instances = document
            .listeners
            .iter()
            .map(|i| (PluginKind::Listener, i))
            .chain(document.buffers.iter().map(|i| (PluginKind::Buffer, i)));

        for (kind, instance) in instances {
            if let Err(e) = gateway.instantiate(registry, kind, instance) {
                if policy == InstancePolicy::Abort {
                    error!(instance = %instance.name, error = %e, "Invalid {} instance, aborting", kind);
                    return Err(e);
                }
                error!(instance = %instance.name, error = %e, "Invalid {} instance, skipping", kind);
                gateway.skipped.push(e);
            }
        }

        info!(
            listeners = gateway.listeners.len(),
            buffers = gateway.buffers.len(),
            skipped = gateway.skipped.len(),
            "Gateway configured"
        );
        Ok(gateway)
    }

    /// Build one instance through the registry and add it
    pub fn instantiate(
        &mut self,
        registry: &PluginRegistry,
        kind: PluginKind,
        instance: &InstanceConfig,
    ) -> Result<()> {
        let init = instance.init()?;
        instance.runtime()?;
        if self.store.contains(&instance.name) {
            return Err(ConfigError::DuplicateName(instance.name.clone()).into());
        }

        match registry.instantiate_kind(kind, &instance.type_name, &instance.name, init)? {
            PluginInstance::Listener(listener) => self.add_listener(instance, listener),
            PluginInstance::Buffer(adapter) => self.add_buffer(instance, adapter).map(|_| ()),
        }
    }

    /// Add a constructed listener
    ///
    /// The initial runtime settings are applied right away; if the listener
    /// refuses them it is not added.
    pub fn add_listener(&mut self, instance: &InstanceConfig, mut listener: Box<dyn Listener>) -> Result<()> {
        let init = instance.init()?.clone();
        let runtime = instance.runtime()?.clone();
        if self.store.contains(&instance.name) {
            return Err(ConfigError::DuplicateName(instance.name.clone()).into());
        }

        listener
            .apply_runtime_settings(&runtime)
            .map_err(ConfigError::from)?;
        self.store.insert(&instance.name, init, runtime.clone())?;

        let (settings, _) = watch::channel(Arc::new(runtime));
        self.listeners.push(ListenerSlot {
            name: instance.name.clone(),
            type_name: instance.type_name.clone(),
            listener: Mutex::new(Some(listener)),
            settings,
            rejected: Arc::new(Mutex::new(None)),
            stats: Arc::new(ListenerStats::new()),
        });
        info!(instance = %instance.name, kind = %instance.type_name, "Listener added");
        Ok(())
    }

    /// Add a constructed buffer adapter
    ///
    /// Returns a handle to the adapter, which stays owned by the gateway.
    pub fn add_buffer(&mut self, instance: &InstanceConfig, adapter: BufferAdapter) -> Result<Arc<BufferAdapter>> {
        let init = instance.init()?.clone();
        let runtime = instance.runtime()?.clone();
        if self.store.contains(&instance.name) {
            return Err(ConfigError::DuplicateName(instance.name.clone()).into());
        }

        adapter
            .update_runtime_settings(Arc::new(runtime.clone()))
            .map_err(ConfigError::from)?;
        self.store.insert(&instance.name, init, runtime)?;

        let adapter = Arc::new(adapter);
        self.buffers.push(BufferSlot {
            type_name: instance.type_name.clone(),
            adapter: Arc::clone(&adapter),
        });
        info!(
            instance = %instance.name,
            kind = %instance.type_name,
            active = adapter.is_active(),
            max_queue = adapter.capacity(),
            "Buffer added"
        );
        Ok(adapter)
    }

    /// Read configuration from `source` on every reload tick
    pub fn set_config_source(&mut self, source: Arc<dyn ConfigSource>) {
        self.source = Some(source);
    }

    /// Call `hook` whenever a refresh changes the log level
    pub fn set_log_level_hook(&mut self, hook: LogLevelHook) {
        self.log_hook = Some(hook);
    }

    /// Current log level
    pub fn log_level(&self) -> LogLevel {
        *self.log_level.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Gateway-level settings
    pub fn section(&self) -> &GatewaySection {
        &self.section
    }

    /// Instances that failed to build under the skip policy
    pub fn skipped(&self) -> &[GatewayError] {
        &self.skipped
    }

    /// Listener names in registration order
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name.as_str()).collect()
    }

    /// Buffer adapters in registration order
    pub fn buffers(&self) -> Vec<Arc<BufferAdapter>> {
        self.buffers.iter().map(|b| Arc::clone(&b.adapter)).collect()
    }

    /// Buffer adapter by name
    pub fn buffer(&self, name: &str) -> Option<Arc<BufferAdapter>> {
        self.buffers
            .iter()
            .find(|b| b.adapter.name() == name)
            .map(|b| Arc::clone(&b.adapter))
    }

    /// Settings of every instance
    pub fn settings(&self) -> &SettingsStore {
        &self.store
    }

    /// Enqueue a reading into every buffer
    ///
    /// Returns how many adapters accepted it. A full queue loses the
    /// reading for that adapter only.
    pub fn fan_out(&self, reading: SharedReading) -> usize {
        fan_out_to(&self.buffers(), &reading)
    }

    /// Apply a configuration document to the running instances
    ///
    /// Only runtime settings and the log level are applied. Instance
    /// additions, removals, type changes and init changes are reported as
    /// requiring a restart.
    ///
    /// A running listener validates its snapshot on its own task, so it is
    /// reported as `published` first. The settings store records the
    /// snapshot once the listener accepted it; a refusal shows up in
    /// `rejected` on the following refresh.
    pub fn refresh(&self, document: &GatewayDocument) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut seen = HashSet::new();

        let instances = document
            .listeners
            .iter()
            .map(|i| (PluginKind::Listener, i))
            .chain(document.buffers.iter().map(|i| (PluginKind::Buffer, i)));

        for (kind, instance) in instances {
            let name = instance.name.as_str();
            if !seen.insert(name) {
                warn!(instance = %name, "Duplicate instance name in configuration, ignoring entry");
                continue;
            }

            let Some(type_name) = self.type_of(kind, name) else {
                if self.store.contains(name) {
                    warn!(instance = %name, "Instance moved to the {} section, requires restart", kind);
                } else {
                    warn!(instance = %name, kind = %instance.type_name, "New instance requires restart");
                }
                report.restart_required.push(name.to_string());
                continue;
            };
            if type_name != instance.type_name {
                warn!(instance = %name, from = %type_name, to = %instance.type_name, "Type change requires restart");
                report.restart_required.push(name.to_string());
                continue;
            }

            if let (Some(init), Some(current)) = (&instance.init_settings, self.store.init(name)) {
                if *init != *current {
                    warn!(instance = %name, "Init settings changed, requires restart");
                    report.restart_required.push(name.to_string());
                }
            }

            let runtime = match instance.runtime() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(instance = %name, error = %e, "Keeping current runtime settings");
                    report.rejected.push(name.to_string());
                    continue;
                }
            };
            if self.store.runtime(name).is_some_and(|current| *current == *runtime) {
                continue;
            }

            let list = match self.apply_runtime(kind, name, runtime) {
                Applied::Changed => &mut report.changed,
                Applied::Published => &mut report.published,
                Applied::Rejected => &mut report.rejected,
                Applied::Pending => continue,
            };
            list.push(name.to_string());
        }

        for name in self.store.names() {
            if !seen.contains(name.as_str()) {
                warn!(instance = %name, "Instance removed from configuration, requires restart");
                report.restart_required.push(name);
            }
        }

        if self.set_log_level(document.gateway.loglevel) {
            report.log_level = Some(document.gateway.loglevel);
        }
        report
    }

    /// Load the configuration source and refresh from it
    ///
    /// On error nothing changes.
    pub async fn reload(&self) -> Result<RefreshReport> {
        let Some(source) = &self.source else {
            return Ok(RefreshReport::default());
        };
        let document = source.load().await?;
        Ok(self.refresh(&document))
    }

    /// Snapshot of every instance
    pub fn status(&self) -> GatewayStatus {
        let listeners = self
            .listeners
            .iter()
            .map(|l| l.stats.snapshot(&l.name, &l.type_name))
            .collect();
        let buffers = self
            .buffers
            .iter()
            .map(|b| BufferStatus {
                name: b.adapter.name().to_string(),
                type_name: b.type_name.clone(),
                active: b.adapter.is_active(),
                queued: b.adapter.queue_len(),
                capacity: b.adapter.capacity(),
                stats: b.adapter.stats(),
            })
            .collect();
        GatewayStatus::new(self.started.elapsed().as_secs(), listeners, buffers)
    }

    /// Run every listener, the fan-out and the delivery loops until
    /// `shutdown` is cancelled
    ///
    /// Listeners are closed on the way out. Queued readings stay in their
    /// adapters. In-flight deliveries get `gateway.shutdown_timeout`
    /// seconds to finish, after which the remaining tasks are aborted and
    /// their batches stay queued.
    pub async fn run(&self, shutdown: CancellationToken) {
        let (sender, receiver) = mpsc::channel(self.section.channel_capacity.max(1));
        let mut tasks = JoinSet::new();

        for slot in &self.listeners {
            let Some((listener, feed)) = slot.start(&self.store) else {
                warn!(instance = %slot.name, "Listener already started");
                continue;
            };
            tasks.spawn(run_listener(
                listener,
                feed,
                sender.clone(),
                Arc::clone(&slot.stats),
                shutdown.clone(),
            ));
        }
        drop(sender);

        let adapters = self.buffers();
        tasks.spawn(run_fan_out(adapters.clone(), receiver, shutdown.clone()));
        for adapter in adapters {
            tasks.spawn(run_delivery(adapter, shutdown.clone()));
        }
        info!(
            listeners = self.listeners.len(),
            buffers = self.buffers.len(),
            "Gateway running"
        );

        self.reload_loop(&shutdown).await;

        let grace = Duration::from_secs(self.section.shutdown_timeout);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Gateway task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                tasks = tasks.len(),
                timeout_secs = self.section.shutdown_timeout,
                "Tasks still running after shutdown timeout, aborting"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        error!(error = %e, "Gateway task failed");
                    }
                }
            }
        }
        info!(queued = self.status().total_queued(), "Gateway stopped");
    }

    async fn reload_loop(&self, shutdown: &CancellationToken) {
        let Some(source) = self.source.clone() else {
            shutdown.cancelled().await;
            return;
        };

        let period = Duration::from_secs(self.section.reload_interval.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match source.load().await {
                    Ok(document) => {
                        let report = self.refresh(&document);
                        if !report.changed.is_empty() || !report.published.is_empty() {
                            info!(changed = ?report.changed, published = ?report.published, "Runtime settings updated");
                        }
                    }
                    Err(e) => {
                        warn!(source = %source.describe(), error = %e, "Settings reload failed, keeping current settings");
                    }
                },
            }
        }
    }

    fn type_of(&self, kind: PluginKind, name: &str) -> Option<&str> {
        match kind {
            PluginKind::Listener => self
                .listeners
                .iter()
                .find(|l| l.name == name)
                .map(|l| l.type_name.as_str()),
            PluginKind::Buffer => self
                .buffers
                .iter()
                .find(|b| b.adapter.name() == name)
                .map(|b| b.type_name.as_str()),
        }
    }

    fn apply_runtime(&self, kind: PluginKind, name: &str, runtime: &Settings) -> Applied {
        match kind {
            PluginKind::Listener => match self.listeners.iter().find(|l| l.name == name) {
                Some(slot) => slot.apply(&self.store, runtime),
                None => Applied::Rejected,
            },
            PluginKind::Buffer => {
                let Some(adapter) = self.buffer(name) else {
                    return Applied::Rejected;
                };
                match adapter.update_runtime_settings(Arc::new(runtime.clone())) {
                    Ok(()) => {
                        self.store.replace_runtime(name, runtime.clone());
                        Applied::Changed
                    }
                    Err(e) => {
                        warn!(instance = %name, error = %e, "Runtime settings rejected, keeping previous");
                        Applied::Rejected
                    }
                }
            }
        }
    }

    fn set_log_level(&self, level: LogLevel) -> bool {
        {
            let mut current = self.log_level.lock().unwrap_or_else(|e| e.into_inner());
            if *current == level {
                return false;
            }
            *current = level;
        }
        if let Some(hook) = &self.log_hook {
            hook(level);
        }
        info!(level = %level, "Log level changed");
        true
    }
}

fn fan_out_to(buffers: &[Arc<BufferAdapter>], reading: &SharedReading) -> usize {
    let mut accepted = 0;
    for adapter in buffers {
        match adapter.enqueue(Arc::clone(reading)) {
            Ok(Enqueued::Queued) => accepted += 1,
            Ok(Enqueued::EvictedOldest) => {
                accepted += 1;
                warn!(instance = %adapter.name(), "Queue full, oldest reading dropped (data loss)");
            }
            Err(e) => {
                warn!(instance = %adapter.name(), node = reading.node(), error = %e, "Reading dropped (data loss)");
            }
        }
    }
    accepted
}

async fn run_listener(
    mut listener: Box<dyn Listener>,
    mut feed: SettingsFeed,
    readings: mpsc::Sender<SharedReading>,
    stats: Arc<ListenerStats>,
    shutdown: CancellationToken,
) {
    let name = feed.name.clone();
    stats.set_state(ListenerState::Running);
    debug!(instance = %name, "Listener started");
    let mut settings_open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = feed.receiver.changed(), if settings_open => {
                if changed.is_err() {
                    settings_open = false;
                    continue;
                }
                feed.apply_latest(listener.as_mut());
            }
            result = listener.read() => match result {
                Ok(reading) => {
                    stats.record_reading();
                    debug!(instance = %name, node = reading.node(), values = reading.values().len(), "Reading received");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        sent = readings.send(reading.shared()) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.is_recoverable() => {
                    stats.record_error(e.to_string());
                    warn!(instance = %name, error = %e, "Acquisition failed");
                }
                Err(e) => {
                    stats.record_error(e.to_string());
                    error!(instance = %name, error = %e, "Listener stopped");
                    break;
                }
            },
        }
    }

    listener.close().await;
    stats.set_state(ListenerState::Stopped);
    debug!(instance = %name, "Listener closed");
}

async fn run_fan_out(
    buffers: Vec<Arc<BufferAdapter>>,
    mut readings: mpsc::Receiver<SharedReading>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            reading = readings.recv() => match reading {
                Some(reading) => {
                    fan_out_to(&buffers, &reading);
                }
                None => {
                    debug!("All listeners ended");
                    return;
                }
            },
        }
    }

    readings.close();
    while let Ok(reading) = readings.try_recv() {
        fan_out_to(&buffers, &reading);
    }
}

async fn run_delivery(adapter: Arc<BufferAdapter>, shutdown: CancellationToken) {
    let mut settings = adapter.subscribe();
    let mut last = Instant::now();

    loop {
        let due = last + adapter.interval();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            // Recompute the deadline from the new interval
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep_until(due) => {}
        }

        match adapter.flush().await {
            Ok(FlushOutcome::Delivered(n)) => {
                debug!(instance = %adapter.name(), delivered = n, queued = adapter.queue_len(), "Batch delivered");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(instance = %adapter.name(), queued = adapter.queue_len(), error = %e, "Delivery failed, will retry");
            }
        }
        last = Instant::now();
    }
}
