// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! TCP socket listener
//!
//! Accepts connections on a port, reads each connection to EOF and decodes
//! the `\r\n` separated frames it carried. Typically fed by an ethernet
//! sensor node or another gateway relaying frames.
//!
//! Init settings: `port` (required, `0` picks a free port),
//! `frame_format` (`generic` or `rfm2pi`, default `generic`).

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::frame::{decode_frame, FrameBuffer, FrameFormat};
use super::Listener;
use crate::error::{ConstructionError, ListenerError, SettingError};
use crate::reading::Reading;
use crate::settings::Settings;

/// Maximum bytes accepted from one connection
const MAX_CONNECTION_BYTES: usize = 4096;

/// Time allowed for a peer to send its frames and close
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    received: usize,
    deadline: Instant,
}

/// Listener reading frames from TCP connections
#[derive(Debug)]
pub struct SocketListener {
    name: String,
    format: FrameFormat,
    local_addr: SocketAddr,
    /// Bound socket waiting to be registered with the runtime
    bound: Option<std::net::TcpListener>,
    listener: Option<TcpListener>,
    connection: Option<Connection>,
    frames: FrameBuffer,
    sequence: u64,
}

impl SocketListener {
    /// Bind on all interfaces
    pub fn bind(
        name: impl Into<String>,
        port: u16,
        format: FrameFormat,
    ) -> Result<Self, ConstructionError> {
        let name = name.into();
        debug!(instance = %name, port, "Opening socket");

        let open_error = |e: std::io::Error| {
            ConstructionError::new(&name, format!("Could not open port {}: {}", port, e))
        };
        let bound = std::net::TcpListener::bind(("0.0.0.0", port)).map_err(open_error)?;
        bound.set_nonblocking(true).map_err(open_error)?;
        let local_addr = bound.local_addr().map_err(open_error)?;

        Ok(Self {
            name,
            format,
            local_addr,
            bound: Some(bound),
            listener: None,
            connection: None,
            frames: FrameBuffer::new(),
            sequence: 0,
        })
    }

    /// Build from init settings
    pub fn from_settings(name: &str, init: &Settings) -> Result<Self, ConstructionError> {
        let port = init
            .require_u64("port")
            .map_err(|e| ConstructionError::new(name, e))?;
        let port = u16::try_from(port).map_err(|_| {
            ConstructionError::new(
                name,
                SettingError::new("port", format!("{} is not a valid port", port)),
            )
        })?;
        let format = init
            .str_or("frame_format", "generic")
            .and_then(|f| f.parse::<FrameFormat>())
            .map_err(|e| ConstructionError::new(name, e))?;

        Self::bind(name, port, format)
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Frame layout in use
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    fn listener(&mut self) -> Result<&TcpListener, ListenerError> {
        if self.listener.is_none() {
            let bound = self
                .bound
                .take()
                .ok_or_else(|| ListenerError::Unrecoverable("socket is closed".to_string()))?;
            let listener = TcpListener::from_std(bound)
                .map_err(|e| ListenerError::Unrecoverable(format!("socket unusable: {}", e)))?;
            self.listener = Some(listener);
        }
        self.listener
            .as_ref()
            .ok_or_else(|| ListenerError::Unrecoverable("socket is closed".to_string()))
    }

    fn next_reading(&mut self) -> Result<Option<Reading>, ListenerError> {
        while let Some(frame) = self.frames.next_frame() {
            debug!(instance = %self.name, frame = %frame, "Socket RX");
            if let Some(reading) = decode_frame(self.format, &frame)? {
                self.sequence += 1;
                return Ok(Some(reading.with_sequence(self.sequence)));
            }
        }
        Ok(None)
    }

    /// Forget the connection and any unterminated frame it sent
    fn end_connection(&mut self, peer: SocketAddr) {
        self.connection = None;
        let dropped = self.frames.discard_partial();
        if dropped > 0 {
            debug!(instance = %self.name, %peer, bytes = dropped, "Discarding incomplete frame");
        }
    }
}

#[async_trait]
impl Listener for SocketListener {
    async fn read(&mut self) -> Result<Reading, ListenerError> {
        loop {
            if let Some(reading) = self.next_reading()? {
                return Ok(reading);
            }

            if let Some(conn) = self.connection.as_mut() {
                let mut chunk = [0u8; 512];
                let result = tokio::time::timeout_at(conn.deadline, conn.stream.read(&mut chunk)).await;
                let peer = conn.peer;
                match result {
                    Ok(Ok(0)) => {
                        debug!(instance = %self.name, %peer, "Connection closed");
                        self.end_connection(peer);
                    }
                    Ok(Ok(n)) => {
                        conn.received += n;
                        self.frames.push(&chunk[..n]);
                        if conn.received >= MAX_CONNECTION_BYTES {
                            warn!(instance = %self.name, %peer, "Connection exceeded {} bytes, closing", MAX_CONNECTION_BYTES);
                            self.end_connection(peer);
                        }
                    }
                    Ok(Err(e)) => {
                        self.end_connection(peer);
                        return Err(ListenerError::Acquisition(format!(
                            "read from {} failed: {}",
                            peer, e
                        )));
                    }
                    Err(_) => {
                        self.end_connection(peer);
                        return Err(ListenerError::Acquisition(format!(
                            "timed out reading from {}",
                            peer
                        )));
                    }
                }
                continue;
            }

            let accepted = self.listener()?.accept().await;
            match accepted {
                Ok((stream, peer)) => {
                    debug!(instance = %self.name, %peer, "Connection accepted");
                    self.connection = Some(Connection {
                        stream,
                        peer,
                        received: 0,
                        deadline: Instant::now() + CONNECTION_TIMEOUT,
                    });
                }
                Err(e) => {
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    return Err(ListenerError::Acquisition(format!("accept failed: {}", e)));
                }
            }
        }
    }

    fn apply_runtime_settings(&mut self, _settings: &Settings) -> Result<(), SettingError> {
        Ok(())
    }

    async fn close(&mut self) {
        debug!(instance = %self.name, "Closing socket");
        self.connection = None;
        self.listener = None;
        self.bound = None;
        self.frames.clear();
    }
}
