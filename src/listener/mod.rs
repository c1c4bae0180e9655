// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Listener abstraction module
//!
//! A listener wraps one data origin (a TCP socket, a 1-Wire filesystem
//! mount, ...) and produces an unbounded sequence of [`Reading`]s. The
//! gateway drives each listener from its own task:
//!
//! ```text
//!   loop {
//!       select! {
//!           shutdown              => close and return
//!           new runtime snapshot  => apply_runtime_settings()
//!           listener.read()       => forward reading / log error
//!       }
//!   }
//! ```
//!
//! Because a pending [`Listener::read`] may be dropped when a new settings
//! snapshot arrives, implementations keep all acquisition state in `self`
//! and only await on cancel-safe operations.

use async_trait::async_trait;

use crate::error::{ListenerError, SettingError};
use crate::reading::Reading;
use crate::settings::Settings;

pub mod frame;
pub mod owfs;
pub mod socket;

pub use frame::{decode_frame, FrameBuffer, FrameFormat};
pub use owfs::OwfsListener;
pub use socket::SocketListener;

/// Trait for data source plugins
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next reading
    ///
    /// [`ListenerError::Acquisition`] reports one failed attempt; the gateway
    /// logs it and calls `read` again. [`ListenerError::Unrecoverable`] means
    /// the origin is gone and the listener is stopped.
    async fn read(&mut self) -> Result<Reading, ListenerError>;

    /// Install a complete new runtime settings snapshot
    ///
    /// Takes effect from the next acquisition cycle. Open resources are kept.
    /// On error the previous settings stay in force.
    fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError>;

    /// Release held resources
    async fn close(&mut self) {}
}
