// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Emoncms destination
//!
//! Ships batches to an emoncms server through its bulk input API:
//!
//! ```text
//! GET {protocol}{domain}{path}/input/bulk.json
//!     ?apikey=...&data=[[ts,node,v1,v2,...],...]&sentat=ts
//! ```
//!
//! The server answers `ok` when the whole batch was accepted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{debug, info};

use super::Destination;
use crate::error::{ConstructionError, DeliveryError, SettingError};
use crate::reading::SharedReading;
use crate::settings::Settings;

/// Protocol used when none is configured
pub const DEFAULT_PROTOCOL: &str = "http://";

/// Request timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 10;

#[derive(Debug, Clone)]
struct Endpoint {
    url: Url,
    apikey: String,
    timeout: Duration,
}

/// Destination posting readings to emoncms
#[derive(Debug)]
pub struct EmoncmsDestination {
    name: String,
    client: Client,
    endpoint: Option<Endpoint>,
}

impl EmoncmsDestination {
    /// Build the HTTP client. No init settings are used.
    pub fn from_settings(name: &str, _init: &Settings) -> Result<Self, ConstructionError> {
        let client = Client::builder()
            .user_agent(concat!("oemgateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConstructionError::new(name, e))?;
        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: None,
        })
    }

    /// Bulk endpoint currently in use, without credentials
    pub fn url(&self) -> Option<&Url> {
        self.endpoint.as_ref().map(|e| &e.url)
    }
}

/// Render a batch as the `data` parameter of a bulk request
pub fn bulk_payload(batch: &[SharedReading]) -> String {
    let rows = batch
        .iter()
        .map(|reading| {
            let mut row = vec![
                Value::from(reading.timestamp().timestamp()),
                Value::from(reading.node()),
            ];
            row.extend(
                reading
                    .values()
                    .iter()
                    .map(|m| m.value.map_or(Value::Null, Value::from)),
            );
            Value::Array(row)
        })
        .collect();
    Value::Array(rows).to_string()
}

#[async_trait]
impl Destination for EmoncmsDestination {
    fn apply_runtime_settings(&mut self, settings: &Settings) -> Result<(), SettingError> {
        let domain = settings.require_str("domain")?;
        let apikey = settings.require_str("apikey")?;

        let mut protocol = settings.str_or("protocol", DEFAULT_PROTOCOL)?;
        if !protocol.ends_with("://") {
            protocol.push_str("://");
        }

        let path = settings.str_or("path", "")?;
        let path = path.trim_end_matches('/');
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let timeout = settings.u64_or("timeout", DEFAULT_TIMEOUT)?;
        if timeout == 0 {
            return Err(SettingError::new("timeout", "must be at least 1 second"));
        }

        let url = Url::parse(&format!(
            "{}{}{}/input/bulk.json",
            protocol,
            domain.trim_end_matches('/'),
            path
        ))
        .map_err(|e| SettingError::new("domain", format!("invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SettingError::new(
                "protocol",
                format!("unsupported protocol '{}'", url.scheme()),
            ));
        }

        if self.url() != Some(&url) {
            info!(instance = %self.name, url = %url, "Destination set");
        }
        self.endpoint = Some(Endpoint {
            url,
            apikey,
            timeout: Duration::from_secs(timeout),
        });
        Ok(())
    }

    async fn deliver(&mut self, batch: &[SharedReading]) -> Result<(), DeliveryError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| DeliveryError::Misconfigured("no domain or apikey set".to_string()))?;

        let data = bulk_payload(batch);
        let sentat = Utc::now().timestamp().to_string();
        debug!(instance = %self.name, url = %endpoint.url, data = %data, "Sending bulk request");

        // reqwest errors carry the full URL, query string and credential included
        let response = self
            .client
            .get(endpoint.url.clone())
            .query(&[
                ("apikey", endpoint.apikey.as_str()),
                ("data", data.as_str()),
                ("sentat", sentat.as_str()),
            ])
            .timeout(endpoint.timeout)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;

        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!("HTTP {}", status)));
        }
        let reply = body.trim();
        if reply != "ok" {
            let reply: String = reply.chars().take(80).collect();
            return Err(DeliveryError::Rejected(format!("unexpected reply '{}'", reply)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Measurement, Reading};
    use chrono::TimeZone;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one HTTP request and hand back its head
    async fn serve_once(status: &'static str, body: &'static str) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (addr, handle)
    }

    fn destination(domain: &str) -> EmoncmsDestination {
        let mut destination = EmoncmsDestination::from_settings("emoncms", &Settings::new()).unwrap();
        destination
            .apply_runtime_settings(
                &Settings::new()
                    .with("domain", domain)
                    .with("apikey", "secret123")
                    .with("path", "emoncms/")
                    .with("timeout", 2),
            )
            .unwrap();
        destination
    }

    fn batch() -> Vec<SharedReading> {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        vec![
            Reading::at(10, vec![Measurement::new("1", 21.5), Measurement::missing("2")], at).shared(),
            Reading::at(11, vec![Measurement::new("1", 250.0)], at).shared(),
        ]
    }

    #[test]
    fn test_bulk_payload() {
        assert_eq!(
            bulk_payload(&batch()),
            "[[1704067200,10,21.5,null],[1704067200,11,250.0]]"
        );
        assert_eq!(bulk_payload(&[]), "[]");
    }

    #[test]
    fn test_runtime_settings_validation() {
        let mut destination = EmoncmsDestination::from_settings("emoncms", &Settings::new()).unwrap();
        let missing_key = Settings::new().with("domain", "emoncms.org");
        let err = destination.apply_runtime_settings(&missing_key).unwrap_err();
        assert_eq!(err.key, "apikey");

        let bad_protocol = missing_key.clone().with("apikey", "x").with("protocol", "ftp://");
        assert!(destination.apply_runtime_settings(&bad_protocol).is_err());
        assert!(destination.url().is_none());

        let ok = missing_key.with("apikey", "x").with("protocol", "https");
        destination.apply_runtime_settings(&ok).unwrap();
        assert_eq!(
            destination.url().unwrap().as_str(),
            "https://emoncms.org/input/bulk.json"
        );
    }

    #[tokio::test]
    async fn test_deliver_without_settings_is_misconfigured() {
        let mut destination = EmoncmsDestination::from_settings("emoncms", &Settings::new()).unwrap();
        let result = destination.deliver(&batch()).await;
        assert!(matches!(result, Err(DeliveryError::Misconfigured(_))));
    }

    #[tokio::test]
    async fn test_deliver_sends_bulk_request() {
        let (addr, server) = serve_once("200 OK", "ok").await;
        let mut destination = destination(&addr.to_string());

        destination.deliver(&batch()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /emoncms/input/bulk.json?apikey=secret123&data="));
        assert!(request.contains("&sentat="));
    }

    #[tokio::test]
    async fn test_deliver_rejects_unexpected_reply() {
        let (addr, _server) = serve_once("200 OK", "Invalid API key").await;
        let mut destination = destination(&addr.to_string());
        let result = destination.deliver(&batch()).await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_deliver_rejects_http_error() {
        let (addr, _server) = serve_once("500 Internal Server Error", "ok").await;
        let mut destination = destination(&addr.to_string());
        let result = destination.deliver(&batch()).await;
        assert!(matches!(result, Err(DeliveryError::Rejected(reason)) if reason.contains("500")));
    }

    #[tokio::test]
    async fn test_transport_error_hides_credential() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut destination = destination(&addr.to_string());
        match destination.deliver(&batch()).await {
            Err(DeliveryError::Transport(reason)) => assert!(!reason.contains("secret123")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
