// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! 1-Wire filesystem (OWFS) listener
//!
//! Periodically scans an OWFS mount and reports the temperature of every
//! enumerated sensor as one reading under a fixed node id.
//!
//! Init settings:
//!
//! | key          | default      | constraint          |
//! |--------------|--------------|---------------------|
//! | `path`       | `/mnt/1wire` | readable directory  |
//! | `node`       | `9`          | 1..=30              |
//! | `interval`   | `60`         | seconds, 0 = no wait|
//! | `resolution` | `9`          | 9, 10, 11 or 12 bits|
//!
//! Runtime settings: every key starting with `sensor` names one sensor id.
//! Sensors are reported in key order. The id `dummy` keeps a slot without a
//! value so the position of real sensors does not shift.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Listener;
use crate::error::{ConstructionError, ListenerError, SettingError};
use crate::reading::{Measurement, NodeId, Reading};
use crate::settings::Settings;

/// Default OWFS mount point
pub const DEFAULT_PATH: &str = "/mnt/1wire";

/// Default node id
pub const DEFAULT_NODE: u64 = 9;

/// Default scan interval in seconds
pub const DEFAULT_INTERVAL: u64 = 60;

/// Default DS18B20 resolution in bits
pub const DEFAULT_RESOLUTION: u64 = 9;

/// One enumerated sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSlot {
    /// Settings key (`sensor1`, `sensor2`, ...)
    pub key: String,
    /// 1-Wire device id or `dummy`
    pub id: String,
}

impl SensorSlot {
    fn is_dummy(&self) -> bool {
        self.id.eq_ignore_ascii_case("dummy")
    }
}

/// Listener scanning a 1-Wire filesystem
#[derive(Debug)]
pub struct OwfsListener {
    name: String,
    path: PathBuf,
    node: NodeId,
    interval: Duration,
    resolution: u8,
    sensors: Vec<SensorSlot>,
    next_scan: Option<Instant>,
    sequence: u64,
}

impl OwfsListener {
    /// Build from init settings
    pub fn from_settings(name: &str, init: &Settings) -> Result<Self, ConstructionError> {
        let err = |e: SettingError| ConstructionError::new(name, e);

        let path = PathBuf::from(init.str_or("path", DEFAULT_PATH).map_err(err)?);
        if std::fs::read_dir(&path).is_err() {
            return Err(err(SettingError::new(
                "path",
                format!("OWFS path not valid: {}", path.display()),
            )));
        }

        let node = init.u64_or("node", DEFAULT_NODE).map_err(err)?;
        if !(1..=30).contains(&node) {
            return Err(err(SettingError::new("node", "Node must be between 1 and 30")));
        }

        let interval = init.u64_or("interval", DEFAULT_INTERVAL).map_err(err)?;

        let resolution = init.u64_or("resolution", DEFAULT_RESOLUTION).map_err(err)?;
        if !(9..=12).contains(&resolution) {
            return Err(err(SettingError::new(
                "resolution",
                "Resolution must be 9, 10, 11 or 12",
            )));
        }

        info!(instance = %name, path = %path.display(), "Initialising OWFS listener");
        info!(instance = %name, node, interval, "Node ID {} sending every {}s", node, interval);

        Ok(Self {
            name: name.to_string(),
            path,
            node: node as NodeId,
            interval: Duration::from_secs(interval),
            resolution: resolution as u8,
            sensors: Vec::new(),
            next_scan: None,
            sequence: 0,
        })
    }

    /// Mount point being scanned
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Node id readings are reported under
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Currently enumerated sensors
    pub fn sensors(&self) -> &[SensorSlot] {
        &self.sensors
    }

    /// Classify a failure to open the mount
    ///
    /// Only a mount that is gone or no longer a directory stops the
    /// listener. Anything else is retried on the next read.
    async fn mount_error(&self, err: std::io::Error) -> ListenerError {
        let gone = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => !meta.is_dir(),
            Err(meta_err) => meta_err.kind() == std::io::ErrorKind::NotFound,
        };
        if gone || err.kind() == std::io::ErrorKind::NotFound {
            ListenerError::Unrecoverable(format!(
                "OWFS path {} unavailable: {}",
                self.path.display(),
                err
            ))
        } else {
            ListenerError::Acquisition(format!("opening {} failed: {}", self.path.display(), err))
        }
    }

    async fn scan(&self) -> Result<Vec<Measurement>, ListenerError> {
        let mut entries = match tokio::fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) => return Err(self.mount_error(e).await),
        };

        let mut present = HashSet::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    present.insert(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(ListenerError::Acquisition(format!(
                        "listing {} failed: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }

        let mut values = Vec::with_capacity(self.sensors.len());
        for slot in &self.sensors {
            if slot.is_dummy() {
                debug!(instance = %self.name, "Skipping dummy sensor");
                values.push(Measurement::missing(&slot.key));
                continue;
            }
            if !present.contains(&slot.id) {
                debug!(instance = %self.name, sensor = %slot.id, "Sensor does not exist");
                values.push(Measurement::missing(&slot.key));
                continue;
            }
            let value = self.read_temperature(&slot.id).await;
            values.push(Measurement {
                name: slot.key.clone(),
                value,
            });
        }
        Ok(values)
    }

    async fn read_temperature(&self, id: &str) -> Option<f64> {
        let file = self
            .path
            .join(id)
            .join(format!("temperature{}", self.resolution));
        match tokio::fs::read_to_string(&file).await {
            Ok(contents) => {
                let raw = contents.lines().next().unwrap_or("").trim();
                match raw.parse::<f64>() {
                    Ok(t) => {
                        debug!(instance = %self.name, sensor = %id, "Read {}C", t);
                        Some(t)
                    }
                    Err(_) => {
                        warn!(instance = %self.name, sensor = %id, "Unparseable temperature '{}'", raw);
                        None
                    }
                }
            }
            Err(e) => {
                warn!(instance = %self.name, sensor = %id, error = %e, "Unable to read temperature");
                None
            }
        }
    }
}

#[async_trait]
impl Listener for OwfsListener {
    async fn read(&mut self) -> Result<Reading, ListenerError> {
        if let Some(due) = self.next_scan {
            tokio::time::sleep_until(due).await;
        }

        debug!(instance = %self.name, path = %self.path.display(), "Reading OWFS");
        let values = self.scan().await?;

        // Schedule advances only after a completed scan
        self.next_scan = Some(Instant::now() + self.interval);
        self.sequence += 1;
        Ok(Reading::new(self.node, values).with_sequence(self.sequence))
    }

    fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError> {
        let mut sensors = Vec::new();
        for (key, _) in settings.iter().filter(|(k, _)| k.starts_with("sensor")) {
            let id = settings
                .require_str(key)
                .map_err(|_| SettingError::new(key.as_str(), "sensor id must be a non-empty string"))?;
            sensors.push(SensorSlot {
                key: key.clone(),
                id,
            });
        }

        if sensors != self.sensors {
            info!(instance = %self.name, "Added {} sensors", sensors.len());
            for slot in &sensors {
                debug!(instance = %self.name, sensor = %slot.id, "Sensor ID");
            }
            self.sensors = sensors;
        }
        Ok(())
    }
}
