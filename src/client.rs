//! HTTP client module for sending press batches to the collector.
//!
//! This module provides the wire types of the collector protocol and an async
//! HTTP client holding one pooled connection set for the process lifetime.
//! The client performs exactly one attempt per call: retrying is the upload
//! cycle's job, on its next tick.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::store::EventRecord;

/// One press on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Epoch milliseconds
    pub ts_ms: i64,
}

/// Request body of `POST <api_url>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Identifier of the device sending the batch
    pub raspi_no: String,

    /// Presses, oldest first
    pub events: Vec<WireEvent>,
}

impl EventBatch {
    /// Build a batch from durable log records, preserving their order.
    pub fn from_records(source_id: impl Into<String>, records: &[EventRecord]) -> Self {
        Self {
            raspi_no: source_id.into(),
            events: records
                .iter()
                .map(|r| WireEvent {
                    ts_ms: r.timestamp_ms,
                })
                .collect(),
        }
    }

    /// Get the number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Acknowledgement body returned by the collector.
///
/// Only used for logging: any 200 response acknowledges the whole batch,
/// whatever its body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CollectorAck {
    /// Status message from the API
    #[serde(default)]
    pub status: String,

    /// Number of events the collector counted
    #[serde(default)]
    pub received: u64,
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server answered with anything but 200
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// Anything that can deliver an [`EventBatch`] to the collector.
pub trait Collector {
    /// Deliver one batch. `Ok` means the collector acknowledged all of it.
    fn send_batch(
        &self,
        batch: &EventBatch,
    ) -> impl Future<Output = Result<CollectorAck, ClientError>> + Send;
}

/// HTTP client for the collector's batch endpoint.
///
/// The underlying `reqwest::Client` is built once and reused, so keep-alive
/// connections are pooled across cycles. It is released when the client is
/// dropped at shutdown.
///
/// # Example
///
/// ```no_run
/// use press_counter::client::{Collector, CollectorClient, EventBatch, WireEvent};
/// use press_counter::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = CollectorClient::new(&config).expect("Failed to create client");
///
///     let batch = EventBatch {
///         raspi_no: config.source_id.clone(),
///         events: vec![WireEvent { ts_ms: 1_700_000_000_000 }],
///     };
///
///     match client.send_batch(&batch).await {
///         Ok(ack) => println!("Collector received {}", ack.received),
///         Err(e) => eprintln!("Failed to send: {}", e),
///     }
/// }
/// ```
pub struct CollectorClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Collector endpoint
    api_url: String,

    /// Request timeout duration
    timeout: Duration,
}

impl CollectorClient {
    /// Create a new collector client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.api_url.clone(), config.request_timeout)
    }

    /// Create a new collector client with custom settings.
    pub fn with_settings(
        api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            timeout,
        })
    }

    /// Get the configured collector URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn post(&self, batch: &EventBatch) -> Result<CollectorAck, ClientError> {
        debug!(
            batch_size = batch.len(),
            url = %self.api_url,
            "Sending press batch"
        );

        let response = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::OK {
            let ack = serde_json::from_str(&body).unwrap_or_else(|e| {
                debug!(error = %e, "Collector acknowledgement is not JSON");
                CollectorAck::default()
            });
            Ok(ack)
        } else {
            Err(ClientError::Status {
                code: status,
                message: body,
            })
        }
    }
}

impl Collector for CollectorClient {
    fn send_batch(
        &self,
        batch: &EventBatch,
    ) -> impl Future<Output = Result<CollectorAck, ClientError>> + Send {
        self.post(batch)
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP responder on a local port.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection: read the full request, answer with `response`.
    /// Resolves to the request body.
    pub(crate) async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/iot/events", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = read_request_body(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            body
        });

        (url, handle)
    }

    async fn read_request_body(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&data);
            if let Some(split) = text.find("\r\n\r\n") {
                let headers = text[..split].to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= split + 4 + length {
                    return String::from_utf8_lossy(&data[split + 4..split + 4 + length])
                        .into_owned();
                }
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::serve_once;
    use super::*;
    use tokio::net::TcpListener;

    fn batch() -> EventBatch {
        EventBatch {
            raspi_no: "raspi_01".to_string(),
            events: vec![
                WireEvent { ts_ms: 1_700_000_000_000 },
                WireEvent { ts_ms: 1_700_000_000_500 },
            ],
        }
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::UNPROCESSABLE_ENTITY,
            message: "events cannot be empty".to_string(),
        };
        assert!(format!("{}", err).contains("422"));
        assert!(format!("{}", err).contains("events cannot be empty"));
    }

    #[test]
    fn test_client_creation() {
        let config = Config::default();
        let client = CollectorClient::new(&config).unwrap();
        assert_eq!(client.api_url(), "http://localhost:8000/api/iot/events");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_batch_wire_format() {
        let json = serde_json::to_value(batch()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "raspi_no": "raspi_01",
                "events": [{"ts_ms": 1_700_000_000_000i64}, {"ts_ms": 1_700_000_000_500i64}]
            })
        );
    }

    #[test]
    fn test_batch_from_records_keeps_order() {
        let records = [
            EventRecord { id: 7, timestamp_ms: 30, delivered: false },
            EventRecord { id: 8, timestamp_ms: 10, delivered: false },
        ];
        let batch = EventBatch::from_records("raspi_02", &records);
        assert_eq!(batch.raspi_no, "raspi_02");
        assert_eq!(batch.events, vec![WireEvent { ts_ms: 30 }, WireEvent { ts_ms: 10 }]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_ack_deserialization() {
        let ack: CollectorAck = serde_json::from_str(r#"{"status": "ok", "received": 2}"#).unwrap();
        assert_eq!(ack.status, "ok");
        assert_eq!(ack.received, 2);

        let ack: CollectorAck = serde_json::from_str("{}").unwrap();
        assert_eq!(ack, CollectorAck::default());
    }

    #[tokio::test]
    async fn test_send_batch_success() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 28\r\nConnection: close\r\n\r\n{\"status\":\"ok\",\"received\":2}",
        )
        .await;
        let client = CollectorClient::with_settings(url, Duration::from_secs(5)).unwrap();

        let ack = client.send_batch(&batch()).await.unwrap();
        assert_eq!(ack.received, 2);

        let body: EventBatch = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body, batch());
    }

    #[tokio::test]
    async fn test_non_json_success_body_still_acknowledges() {
        let (url, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let client = CollectorClient::with_settings(url, Duration::from_secs(5)).unwrap();

        let ack = client.send_batch(&batch()).await.unwrap();
        assert_eq!(ack, CollectorAck::default());
    }

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let (url, _server) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom",
        )
        .await;
        let client = CollectorClient::with_settings(url, Duration::from_secs(5)).unwrap();

        match client.send_batch(&batch()).await {
            Err(ClientError::Status { code, message }) => {
                assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "boom");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_2xx_is_not_success() {
        let (url, _server) = serve_once(
            "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let client = CollectorClient::with_settings(url, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            client.send_batch(&batch()).await,
            Err(ClientError::Status { .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/iot/events", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = CollectorClient::with_settings(url, Duration::from_millis(200)).unwrap();
        assert!(matches!(
            client.send_batch(&batch()).await,
            Err(ClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_request_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/iot/events", listener.local_addr().unwrap());
        drop(listener);

        let client = CollectorClient::with_settings(url, Duration::from_secs(2)).unwrap();
        assert!(client.send_batch(&batch()).await.is_err());
    }
}
