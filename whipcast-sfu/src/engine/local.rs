//! In-process media engine
//!
//! `LocalEngine` implements the engine traits without moving any packets. It
//! keeps the bookkeeping a real engine does (ids, ICE credentials, DTLS
//! fingerprints, candidates, producer/consumer links, state events) so the
//! orchestration layer can run end to end on a single host and in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::codecs::supported_header_extensions;
use super::rtp::{
    CodecParameters, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    Protocol, RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, RtxParameters,
};
use super::{
    ConnectParameters, ConnectionState, Consumer, DtlsState, EngineError, IceState, MediaEngine,
    Producer, Router, StatsReport, Transport, TransportEvent, TransportOptions, Worker,
    WorkerEvent,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use whipcast_core::config::MediaConfig;

const EVENT_CAPACITY: usize = 64;
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
const ICE_ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

fn closed_error(what: &'static str, id: &impl ToString) -> EngineError {
    EngineError::Closed {
        what,
        id: id.to_string(),
    }
}

/// Non-zero SSRC drawn from a fresh UUID
fn random_ssrc() -> u32 {
    let ssrc = uuid::Uuid::new_v4().as_u128() as u32;
    if ssrc == 0 {
        1
    } else {
        ssrc
    }
}

/// Primary and RTX SSRCs announced by `parameters`
fn ssrcs(parameters: &RtpParameters) -> impl Iterator<Item = u32> + '_ {
    parameters
        .encodings
        .iter()
        .flat_map(|e| e.ssrc.into_iter().chain(e.rtx.as_ref().map(|rtx| rtx.ssrc)))
}

/// `AB:CD:...` sha-256 fingerprint derived from the transport id
fn fingerprint_for(transport_id: &TransportId) -> DtlsFingerprint {
    let digest = Sha256::digest(transport_id.as_str().as_bytes());
    let value = digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

/// Round-robin port allocation over the configured RTC range
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    cursor: AtomicUsize,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<u16> {
        if self.min == 0 || self.min > self.max {
            return None;
        }
        let span = usize::from(self.max - self.min) + 1;
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(offset)
            .ok()
            .and_then(|offset| self.min.checked_add(offset))
    }
}

#[derive(Debug, Clone)]
pub struct LocalEngineOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for LocalEngineOptions {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

impl From<&MediaConfig> for LocalEngineOptions {
    fn from(config: &MediaConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
        }
    }
}

pub struct LocalEngine {
    ports: Arc<PortAllocator>,
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new(options: &LocalEngineOptions) -> Self {
        info!(
            listen_ip = %options.listen_ip,
            announced_ip = options.announced_ip.as_deref().unwrap_or("-"),
            rtc_min_port = options.rtc_min_port,
            rtc_max_port = options.rtc_max_port,
            "Local media engine initialized"
        );
        Self {
            ports: Arc::new(PortAllocator::new(options.rtc_min_port, options.rtc_max_port)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Every worker created so far, dead ones included
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        self.workers.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self) -> Result<Arc<dyn Worker>, EngineError> {
        let worker = Arc::new(LocalWorker {
            id: WorkerId::generate(),
            alive: AtomicBool::new(true),
            events: broadcast::channel(EVENT_CAPACITY).0,
            routers: Mutex::new(Vec::new()),
            ports: Arc::clone(&self.ports),
        });
        debug!(worker_id = %worker.id, "Local worker created");
        self.workers.lock().push(Arc::clone(&worker));
        Ok(worker)
    }
}

pub struct LocalWorker {
    id: WorkerId,
    alive: AtomicBool,
    events: broadcast::Sender<WorkerEvent>,
    routers: Mutex<Vec<Arc<LocalRouter>>>,
    ports: Arc<PortAllocator>,
}

impl LocalWorker {
    /// Simulate an unexpected worker exit
    pub fn kill(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(worker_id = %self.id, reason, "Local worker killed");
        self.close_routers();
        let _ = self.events.send(WorkerEvent::Died {
            reason: reason.to_string(),
        });
    }

    fn close_routers(&self) {
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers {
            router.close();
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::WorkerDied(self.id.clone()));
        }
        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one media codec".to_string(),
            ));
        }

        let router = Arc::new(LocalRouter {
            id: RouterId::generate(),
            worker_id: self.id.clone(),
            state: Arc::new(RouterState {
                capabilities: router_capabilities(media_codecs),
                producers: Mutex::new(HashMap::new()),
            }),
            transports: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            ports: Arc::clone(&self.ports),
        });

        let mut routers = self.routers.lock();
        routers.retain(|r| !r.is_closed());
        routers.push(Arc::clone(&router));
        Ok(router)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.close_routers();
    }
}

/// Assign payload types and add an RTX entry after every video codec
fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut codecs = Vec::new();
    let mut next_pt = FIRST_DYNAMIC_PAYLOAD_TYPE;

    for codec in media_codecs.iter().filter(|c| !c.is_rtx()) {
        let mut codec = codec.clone();
        let pt = *codec.preferred_payload_type.get_or_insert(next_pt);
        next_pt = next_pt.max(pt).saturating_add(1);
        let kind = codec.kind;
        codecs.push(codec);

        if kind == MediaKind::Video {
            let mut parameters = CodecParameters::new();
            parameters.insert("apt".to_string(), serde_json::json!(pt));
            codecs.push(RtpCodecCapability {
                kind,
                mime_type: "video/rtx".to_string(),
                preferred_payload_type: Some(next_pt),
                clock_rate: 90000,
                channels: None,
                parameters,
                rtcp_feedback: vec![],
            });
            next_pt = next_pt.saturating_add(1);
        }
    }

    RtpCapabilities {
        codecs,
        header_extensions: supported_header_extensions(),
    }
}

/// State shared by a router and the transports created on it
struct RouterState {
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, Arc<LocalProducer>>>,
}

impl RouterState {
    fn producer(&self, id: &ProducerId) -> Option<Arc<LocalProducer>> {
        self.producers
            .lock()
            .get(id)
            .filter(|p| !p.is_closed())
            .cloned()
    }

    fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.capabilities.codecs.iter().any(|cap| codec.matches(cap))
    }
}

pub struct LocalRouter {
    id: RouterId,
    worker_id: WorkerId,
    state: Arc<RouterState>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
    closed: AtomicBool,
    ports: Arc<PortAllocator>,
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.state.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.state.producer(producer_id) else {
            return false;
        };
        let parameters = producer.rtp_parameters();
        let consumable = parameters
            .media_codecs()
            .any(|codec| rtp_capabilities.codecs.iter().any(|cap| codec.matches(cap)));
        consumable
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.is_closed() {
            return Err(closed_error("Router", &self.id));
        }

        let id = TransportId::generate();
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.ports.next().ok_or(EngineError::PortsExhausted)?;

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: if options.prefer_udp { 1_076_302_079 } else { 1_076_302_078 },
                ip: ip.clone(),
                protocol: Protocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: if options.prefer_udp { 1_076_276_479 } else { 1_076_302_079 },
                ip,
                protocol: Protocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }
        if candidates.is_empty() {
            return Err(EngineError::InvalidParameters(
                "transport must enable udp or tcp".to_string(),
            ));
        }

        let transport = Arc::new(LocalTransport {
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16, &ICE_ALPHABET),
                password: nanoid::nanoid!(32, &ICE_ALPHABET),
                ice_lite: true,
            },
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![fingerprint_for(&id)],
            },
            id,
            candidates,
            router: Arc::clone(&self.state),
            events: broadcast::channel(EVENT_CAPACITY).0,
            state: Mutex::new(TransportState {
                ice: IceState::New,
                dtls: DtlsState::New,
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        });

        let mut transports = self.transports.lock();
        transports.retain(|t| !t.is_closed());
        transports.push(Arc::clone(&transport));
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports {
            transport.close();
        }
        let producers: Vec<_> = self.state.producers.lock().drain().map(|(_, p)| p).collect();
        for producer in producers {
            producer.close();
        }
        debug!(router_id = %self.id, "Local router closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct TransportState {
    ice: IceState,
    dtls: DtlsState,
    producers: Vec<Arc<LocalProducer>>,
    consumers: Vec<Arc<LocalConsumer>>,
}

pub struct LocalTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    dtls_parameters: DtlsParameters,
    candidates: Vec<IceCandidate>,
    router: Arc<RouterState>,
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<TransportState>,
    closed: AtomicBool,
}

impl LocalTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_ice(&self, ice: IceState) {
        self.state.lock().ice = ice;
        self.emit(TransportEvent::IceStateChange(ice));
    }

    fn set_dtls(&self, dtls: DtlsState) {
        self.state.lock().dtls = dtls;
        self.emit(TransportEvent::DtlsStateChange(dtls));
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(closed_error("Transport", &self.id))
        } else {
            Ok(())
        }
    }

    /// Drive the DTLS state to `failed` as a broken handshake would
    pub fn fail(&self) {
        if self.is_closed() {
            return;
        }
        self.set_dtls(DtlsState::Failed);
        self.emit(TransportEvent::ConnectionStateChange(ConnectionState::Failed));
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn ice_state(&self) -> IceState {
        self.state.lock().ice
    }

    fn dtls_state(&self) -> DtlsState {
        self.state.lock().dtls
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn connect(&self, remote: ConnectParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        if remote.dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        {
            let mut state = self.state.lock();
            if state.dtls != DtlsState::New {
                return Err(EngineError::AlreadyConnected(self.id.clone()));
            }
            state.dtls = DtlsState::Connecting;
        }

        self.emit(TransportEvent::DtlsStateChange(DtlsState::Connecting));
        self.emit(TransportEvent::ConnectionStateChange(ConnectionState::Connecting));
        if let Some(ice) = &remote.ice_parameters {
            self.emit(TransportEvent::Trace(format!(
                "remote ice ufrag {}",
                ice.username_fragment
            )));
        }
        self.set_ice(IceState::Connected);
        self.set_dtls(DtlsState::Connected);
        self.emit(TransportEvent::ConnectionStateChange(ConnectionState::Connected));
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        self.ensure_open()?;

        {
            let mut media = rtp_parameters.media_codecs().peekable();
            if media.peek().is_none() {
                return Err(EngineError::InvalidParameters(format!(
                    "{kind} producer has no media codec"
                )));
            }
            if let Some(codec) = media.find(|codec| !self.router.supports(codec)) {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} not supported by router",
                    codec.mime_type
                )));
            }
        }
        {
            let state = self.state.lock();
            let taken = ssrcs(&rtp_parameters).find(|ssrc| {
                state
                    .producers
                    .iter()
                    .filter(|p| !p.closed.load(Ordering::SeqCst))
                    .any(|p| ssrcs(&p.rtp_parameters).any(|s| s == *ssrc))
            });
            if let Some(ssrc) = taken {
                return Err(EngineError::InvalidParameters(format!(
                    "ssrc {ssrc} already in use on transport"
                )));
            }
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&self.router),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        self.router
            .producers
            .lock()
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.state.lock().producers.push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        self.ensure_open()?;

        let producer = self
            .router
            .producer(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;
        let rtp_parameters = consumer_parameters(&producer.rtp_parameters, rtp_capabilities)
            .ok_or_else(|| EngineError::CannotConsume(producer_id.clone()))?;

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });

        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.state.lock().consumers.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let mut reports = vec![StatsReport {
            report_type: "transport".to_string(),
            ..StatsReport::default()
        }];
        reports.extend(state.producers.iter().filter(|p| !p.is_closed()).map(|p| p.report()));
        reports.extend(state.consumers.iter().filter(|c| !c.is_closed()).map(|c| c.report()));
        Ok(reports)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (producers, consumers) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };
        for consumer in consumers {
            consumer.close();
        }
        for producer in producers {
            producer.close();
        }

        self.set_ice(IceState::Closed);
        self.set_dtls(DtlsState::Closed);
        self.emit(TransportEvent::ConnectionStateChange(ConnectionState::Closed));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Pick the first producer codec the consumer supports, plus its RTX
fn consumer_parameters(
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Option<RtpParameters> {
    let codec = producer
        .media_codecs()
        .find(|codec| capabilities.codecs.iter().any(|cap| codec.matches(cap)))?
        .clone();

    let wants_rtx = capabilities.codecs.iter().any(RtpCodecCapability::is_rtx);
    let rtx = producer
        .codecs
        .iter()
        .filter(|c| c.is_rtx() && wants_rtx)
        .find(|c| {
            super::rtp::parameter_str(&c.parameters, "apt") == Some(codec.payload_type.to_string())
        })
        .cloned();

    let header_extensions = producer
        .header_extensions
        .iter()
        .filter(|ext| capabilities.header_extensions.iter().any(|h| h.uri == ext.uri))
        .cloned()
        .collect();

    let encoding = RtpEncodingParameters {
        ssrc: Some(random_ssrc()),
        rtx: rtx.as_ref().map(|_| RtxParameters {
            ssrc: random_ssrc(),
        }),
    };

    let mut codecs = vec![codec];
    codecs.extend(rtx);

    Some(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![encoding],
        rtcp: RtcpParameters {
            cname: producer.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<RouterState>,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    closed: AtomicBool,
}

impl LocalProducer {
    fn report(&self) -> StatsReport {
        StatsReport {
            report_type: "inbound-rtp".to_string(),
            kind: Some(self.kind),
            ssrc: self.rtp_parameters.encodings.first().and_then(|e| e.ssrc),
            ..StatsReport::default()
        }
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError> {
        if self.is_closed() {
            return Err(closed_error("Producer", &self.id));
        }
        Ok(vec![self.report()])
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close();
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.lock().remove(&self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl LocalConsumer {
    fn report(&self) -> StatsReport {
        StatsReport {
            report_type: "outbound-rtp".to_string(),
            kind: Some(self.kind),
            ssrc: self.rtp_parameters.encodings.first().and_then(|e| e.ssrc),
            ..StatsReport::default()
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(closed_error("Consumer", &self.id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        debug!(consumer_id = %self.id, producer_id = %self.producer_id, "Key frame requested");
        Ok(())
    }

    async fn get_stats(&self) -> Result<Vec<StatsReport>, EngineError> {
        self.ensure_open()?;
        Ok(vec![self.report()])
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::codecs::router_media_codecs;

    fn remote_dtls() -> ConnectParameters {
        ConnectParameters {
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "00:11".to_string(),
                }],
            },
            ice_parameters: None,
        }
    }

    fn vp8_parameters(pt: u8) -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: pt,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                rtx: None,
            }],
            ..RtpParameters::default()
        }
    }

    async fn router() -> (LocalEngine, Arc<dyn Router>) {
        let engine = LocalEngine::new(&LocalEngineOptions::default());
        let worker = engine.create_worker().await.unwrap();
        let router = worker.create_router(&router_media_codecs()).await.unwrap();
        (engine, router)
    }

    #[test]
    fn test_port_allocator_wraps() {
        let ports = PortAllocator::new(10000, 10001);
        assert_eq!(ports.next(), Some(10000));
        assert_eq!(ports.next(), Some(10001));
        assert_eq!(ports.next(), Some(10000));
        assert_eq!(PortAllocator::new(5, 4).next(), None);
    }

    #[test]
    fn test_router_capabilities_add_rtx_for_video() {
        let caps = router_capabilities(&router_media_codecs());
        let vp8 = caps.codecs.iter().find(|c| c.mime_type == "video/VP8").unwrap();
        let vp8_pt = vp8.preferred_payload_type.unwrap();
        assert!(caps.codecs.iter().any(|c| {
            c.is_rtx()
                && super::super::rtp::parameter_str(&c.parameters, "apt")
                    == Some(vp8_pt.to_string())
        }));
        let opus = caps.codecs.iter().filter(|c| c.kind == MediaKind::Audio).count();
        assert_eq!(opus, 1);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (_engine, router) = router().await;
        let transport = router.create_transport(&TransportOptions::default()).await.unwrap();
        let mut events = transport.subscribe();

        transport.connect(remote_dtls()).await.unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::DtlsStateChange(DtlsState::Connecting)
        );

        let err = transport.connect(remote_dtls()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyConnected(_)));
    }

    #[tokio::test]
    async fn test_closing_producer_closes_consumers() {
        let (_engine, router) = router().await;
        let ingest = router.create_transport(&TransportOptions::default()).await.unwrap();
        let viewer = router.create_transport(&TransportOptions::default()).await.unwrap();

        let producer = ingest.produce(MediaKind::Video, vp8_parameters(96)).await.unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps));

        let consumer = viewer.consume(producer.id(), &caps, true).await.unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type, 96);

        producer.close();
        assert!(consumer.is_closed());
        assert!(!router.can_consume(producer.id(), &caps));
    }

    #[tokio::test]
    async fn test_produce_rejects_ssrc_in_use() {
        let (_engine, router) = router().await;
        let ingest = router.create_transport(&TransportOptions::default()).await.unwrap();

        let first = ingest.produce(MediaKind::Video, vp8_parameters(96)).await.unwrap();
        let result = ingest.produce(MediaKind::Video, vp8_parameters(96)).await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));

        first.close();
        assert!(ingest.produce(MediaKind::Video, vp8_parameters(96)).await.is_ok());
    }

    #[tokio::test]
    async fn test_consume_requires_matching_capabilities() {
        let (_engine, router) = router().await;
        let ingest = router.create_transport(&TransportOptions::default()).await.unwrap();
        let viewer = router.create_transport(&TransportOptions::default()).await.unwrap();
        let producer = ingest.produce(MediaKind::Video, vp8_parameters(96)).await.unwrap();

        let audio_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: vec![],
        };
        assert!(!router.can_consume(producer.id(), &audio_only));
        let result = viewer.consume(producer.id(), &audio_only, false).await;
        assert!(matches!(result, Err(EngineError::CannotConsume(_))));
    }

    #[tokio::test]
    async fn test_killed_worker_closes_routers_and_notifies() {
        let engine = LocalEngine::new(&LocalEngineOptions::default());
        let worker = engine.create_worker().await.unwrap();
        let mut events = worker.subscribe();
        let router = worker.create_router(&router_media_codecs()).await.unwrap();
        let transport = router.create_transport(&TransportOptions::default()).await.unwrap();

        engine.workers()[0].kill("test");

        assert!(!worker.is_alive());
        assert!(router.is_closed());
        assert!(transport.is_closed());
        assert!(matches!(events.recv().await.unwrap(), WorkerEvent::Died { .. }));
        assert!(worker.create_router(&router_media_codecs()).await.is_err());
    }
}
