//! Media engine interface
//!
//! The SFU core never touches RTP packets. It drives an engine that owns the
//! ICE/DTLS/SRTP machinery through the capability-typed handles defined here:
//!
//! - **`Worker`**: one engine process / thread group; hosts routers
//! - **`Router`**: per-stream routing context with a fixed codec set
//! - **`Transport`**: one ICE + DTLS endpoint
//! - **`Producer`** / **`Consumer`**: inbound / outbound media tracks
//!
//! Every handle is cheaply shareable (`Arc<dyn ...>`), `close()` is idempotent
//! and closing a parent closes its children. State changes are observed with
//! `subscribe()`.

pub mod codecs;
pub mod local;
pub mod rtp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
pub use rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{what} {id} is closed")]
    Closed { what: &'static str, id: String },

    #[error("Transport {0} is already connected")]
    AlreadyConnected(TransportId),

    #[error("Producer {0} not found")]
    UnknownProducer(ProducerId),

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(ProducerId),

    #[error("Worker {0} died")]
    WorkerDied(WorkerId),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("No free RTC port available")]
    PortsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// No media can flow any more
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    IceStateChange(IceState),
    DtlsStateChange(DtlsState),
    ConnectionStateChange(ConnectionState),
    Trace(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Died { reason: String },
}

/// How a transport should listen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

/// Remote parameters handed to `Transport::connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParameters {
    pub dtls_parameters: DtlsParameters,
    /// Only known on the ingest path, where the remote offer carries it
    pub ice_parameters: Option<IceParameters>,
}

/// One statistics entry reported by a transport, producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn Worker>, EngineError>;
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;
    fn is_alive(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent>;
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError>;
    fn close(&self);
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &RouterId;
    fn worker_id(&self) -> &WorkerId;
    fn rtp_capabilities(&self) -> RtpCapabilities;
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;
    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn ice_state(&self) -> IceState;
    fn dtls_state(&self) -> DtlsState;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn connect(&self, remote: ConnectParameters) -> Result<(), EngineError>;
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;
    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    async fn resume(&self) -> Result<(), EngineError>;
    /// Ask the producing endpoint for a fresh keyframe (PLI/FIR upstream)
    async fn request_key_frame(&self) -> Result<(), EngineError>;
    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}
