//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use oemgateway::*;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Listener fed from a channel held by the test
pub struct FeedListener {
    feed: mpsc::Receiver<Reading>,
    applied: Arc<Mutex<Vec<Settings>>>,
}

impl FeedListener {
    pub fn new() -> (Self, mpsc::Sender<Reading>, Arc<Mutex<Vec<Settings>>>) {
        let (sender, feed) = mpsc::channel(64);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let listener = Self {
            feed,
            applied: Arc::clone(&applied),
        };
        (listener, sender, applied)
    }
}

#[async_trait]
impl Listener for FeedListener {
    async fn read(&mut self) -> std::result::Result<Reading, ListenerError> {
        self.feed
            .recv()
            .await
            .ok_or_else(|| ListenerError::Unrecoverable("feed closed".to_string()))
    }

    /// Accepts any snapshot without an `invalid` key
    fn apply_runtime_settings(&mut self, settings: &Settings) -> std::result::Result<(), SettingError> {
        if settings.contains("invalid") {
            return Err(SettingError::new("invalid", "not accepted"));
        }
        self.applied.lock().unwrap().push(settings.clone());
        Ok(())
    }
}

/// Destination whose deliveries never complete
pub struct HangingDestination;

#[async_trait]
impl Destination for HangingDestination {
    fn apply_runtime_settings(&mut self, _settings: &Settings) -> std::result::Result<(), SettingError> {
        Ok(())
    }

    async fn deliver(&mut self, _batch: &[SharedReading]) -> std::result::Result<(), DeliveryError> {
        std::future::pending().await
    }
}

/// Destination that blocks each delivery until released
#[derive(Clone, Default)]
pub struct GatedDestination {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
    pub delivered: Arc<Mutex<Vec<SharedReading>>>,
}

#[async_trait]
impl Destination for GatedDestination {
    fn apply_runtime_settings(&mut self, _settings: &Settings) -> std::result::Result<(), SettingError> {
        Ok(())
    }

    async fn deliver(&mut self, batch: &[SharedReading]) -> std::result::Result<(), DeliveryError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.delivered.lock().unwrap().extend(batch.iter().cloned());
        Ok(())
    }
}

/// Minimal emoncms bulk endpoint answering `ok` to every request
pub struct StubEmoncms {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl StubEmoncms {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match stream.read(&mut chunk).await {
                            Ok(n) => n,
                            Err(_) => return,
                        };
                        head.extend_from_slice(&chunk[..n]);
                        if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&head).into_owned();
                    if let Some(target) = head.split_whitespace().nth(1) {
                        log.lock().unwrap().push(target.to_string());
                    }
                    let response =
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            addr,
            requests,
            handle,
        }
    }

    /// Value for the `domain` runtime setting
    pub fn domain(&self) -> String {
        self.addr.to_string()
    }

    /// Request targets received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Decoded `data` parameter of every request
    pub fn batches(&self) -> Vec<Vec<Vec<Value>>> {
        self.requests()
            .iter()
            .map(|target| {
                let url = reqwest::Url::parse(&format!("http://stub{}", target)).unwrap();
                let data = url
                    .query_pairs()
                    .find(|(k, _)| k == "data")
                    .map(|(_, v)| v.into_owned())
                    .unwrap();
                serde_json::from_str(&data).unwrap()
            })
            .collect()
    }
}

impl Drop for StubEmoncms {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Poll `condition` every 20ms until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn reading(node: u32, value: f64) -> Reading {
    Reading::from_values(node, [value])
}
