//! Downstream domain events
//!
//! Stream and viewer lifecycle changes are published as [`DomainEvent`]s for
//! external analytics / audit services. Delivery is best-effort: publishing
//! never waits, a full queue drops the event with a warning, and sink failures
//! are only logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EventsConfig;

/// Header carrying the RFC 3339 send time
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
/// Header carrying hex(HMAC-SHA256(secret, timestamp + body))
pub const SIGNATURE_HEADER: &str = "X-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    StreamStart,
    StreamStop,
    ViewerJoin,
    ViewerLeave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_type: EventType,
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    fn new(event_type: EventType, stream_id: &str, viewer_id: Option<&str>) -> Self {
        Self {
            event_type,
            stream_id: stream_id.to_string(),
            viewer_id: viewer_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn stream_start(stream_id: &str) -> Self {
        Self::new(EventType::StreamStart, stream_id, None)
    }

    #[must_use]
    pub fn stream_stop(stream_id: &str) -> Self {
        Self::new(EventType::StreamStop, stream_id, None)
    }

    #[must_use]
    pub fn viewer_join(stream_id: &str, viewer_id: &str) -> Self {
        Self::new(EventType::ViewerJoin, stream_id, Some(viewer_id))
    }

    #[must_use]
    pub fn viewer_leave(stream_id: &str, viewer_id: &str) -> Self {
        Self::new(EventType::ViewerLeave, stream_id, Some(viewer_id))
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Event service rejected event with status {status}")]
    Rejected { status: u16 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signing error: {0}")]
    Signing(String),
}

/// Destination for published events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &DomainEvent) -> Result<(), EventError>;
}

/// Writes events to the application log only
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn deliver(&self, event: &DomainEvent) -> Result<(), EventError> {
        info!(
            event_type = ?event.event_type,
            stream_id = %event.stream_id,
            viewer_id = event.viewer_id.as_deref().unwrap_or("-"),
            "Domain event"
        );
        Ok(())
    }
}

/// POSTs signed JSON events to the logging service
pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl HttpEventSink {
    pub fn new(config: &EventsConfig) -> Result<Self, EventError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            secret: config.hmac_secret.clone(),
        })
    }

    /// Compute the request signature the logging service verifies
    pub fn sign(secret: &str, timestamp: &str, body: &str) -> Result<String, EventError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| EventError::Signing(e.to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn deliver(&self, event: &DomainEvent) -> Result<(), EventError> {
        let body = serde_json::to_string(event)?;
        let timestamp = Utc::now().to_rfc3339();
        let signature = Self::sign(&self.secret, &timestamp, &body)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EventError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

/// Non-blocking handle used by the signaling path to emit events
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<DomainEvent>,
}

impl EventPublisher {
    /// Publisher backed by a raw channel; the caller drains the receiver
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Publisher whose events are drained into `sink` by a background task
    ///
    /// The task finishes once every publisher clone has been dropped and the
    /// queue is empty.
    #[must_use]
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (publisher, mut rx) = Self::channel(capacity);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        error = %e,
                        event_type = ?event.event_type,
                        stream_id = %event.stream_id,
                        "Failed to deliver domain event"
                    );
                }
            }
            debug!("Event delivery task finished");
        });

        (publisher, handle)
    }

    /// Build the publisher described by configuration
    pub fn from_config(config: &EventsConfig) -> Result<(Self, JoinHandle<()>), EventError> {
        let sink: Arc<dyn EventSink> = if config.enabled {
            Arc::new(HttpEventSink::new(config)?)
        } else {
            Arc::new(LogEventSink)
        };
        Ok(Self::spawn(sink, config.queue_capacity))
    }

    /// Queue an event without waiting
    pub fn publish(&self, event: DomainEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    event_type = ?event.event_type,
                    stream_id = %event.stream_id,
                    "Event queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event_type = ?event.event_type, "Event queue closed");
            }
        }
    }
}
