// OEM Gateway - Log setup
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tracing subscriber with a reloadable level filter.

use oemgateway::{LogLevel, LogLevelHook};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Handle to change the active filter after startup
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    /// Install the global subscriber
    ///
    /// `RUST_LOG`, when set, wins over `level` for the initial filter.
    pub fn init(level: LogLevel) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.directive()));
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        Self { handle }
    }

    /// Switch every target to `level`
    pub fn set_level(&self, level: LogLevel) {
        match self.handle.reload(EnvFilter::new(level.directive())) {
            Ok(()) => info!(level = %level, "Log level applied"),
            Err(e) => warn!(error = %e, "Could not change log level"),
        }
    }

    /// Hook for [`oemgateway::Gateway::set_log_level_hook`]
    pub fn hook(&self) -> LogLevelHook {
        let control = self.clone();
        Box::new(move |level| control.set_level(level))
    }
}
