//! Viewer signaling session
//!
//! One [`SignalingSession`] per WebSocket connection. The transport layer
//! feeds it text frames in order and writes back whatever reply frame it
//! returns; server-initiated notices travel through the [`ViewerNotice`]
//! channel handed over at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{
    ConnectParameters, DtlsParameters, EngineError, IceCandidate, IceParameters, RtpCapabilities,
    RtpParameters,
};
use crate::error::{SfuError, SfuResult};
use crate::manager::StreamManager;
use crate::types::{ConsumerId, MediaKind, ProducerId, StreamId, TransportId, ViewerId};
use crate::viewer::{Viewer, ViewerNotice};

/// Requests a viewer may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities { stream_id: StreamId },
    #[serde(rename_all = "camelCase")]
    JoinStream {
        stream_id: StreamId,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        stream_id: StreamId,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    Resume { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    RequestKeyFrame { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    LeaveStream { stream_id: StreamId },
}

impl ClientRequest {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            Self::JoinStream { .. } => "joinStream",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Consume { .. } => "consume",
            Self::Resume { .. } => "resume",
            Self::RequestKeyFrame { .. } => "requestKeyFrame",
            Self::LeaveStream { .. } => "leaveStream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Payload of a reply frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Capabilities(RtpCapabilities),
    Transport(TransportInfo),
    Consumers(Vec<ConsumerInfo>),
    Status(&'static str),
    Success { success: bool },
    Error { error: String },
    Empty,
}

impl Reply {
    fn error(e: &SfuError) -> Self {
        Self::Error {
            error: e.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplyFrame<'a> {
    ack: &'a Value,
    data: &'a Reply,
}

/// Serialize a server notice as an `{event, data}` frame
#[must_use]
pub fn notice_frame(notice: &ViewerNotice) -> String {
    serde_json::to_string(notice).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    CapabilitiesExchanged,
    TransportCreated,
    TransportConnected,
    Consuming,
    Disconnected,
}

struct JoinedStream {
    stream_id: StreamId,
    viewer: Arc<Viewer>,
    rtp_capabilities: Option<RtpCapabilities>,
}

pub struct SignalingSession {
    manager: Arc<StreamManager>,
    viewer_id: ViewerId,
    notifier: mpsc::Sender<ViewerNotice>,
    state: SessionState,
    joined: Option<JoinedStream>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(manager: Arc<StreamManager>, notifier: mpsc::Sender<ViewerNotice>) -> Self {
        let viewer_id = ViewerId::generate();
        info!(viewer_id = %viewer_id, "Viewer connected");
        Self {
            manager,
            viewer_id,
            notifier,
            state: SessionState::Connected,
            joined: None,
        }
    }

    pub fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Stream the connection is currently joined to
    pub fn joined_stream(&self) -> Option<&StreamId> {
        self.joined.as_ref().map(|j| &j.stream_id)
    }

    /// Handle one text frame; returns the reply frame when the request carried an `ack`
    pub async fn handle_text(&mut self, text: &str) -> Option<String> {
        let mut value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(viewer_id = %self.viewer_id, error = %e, "Dropping malformed signaling frame");
                return None;
            }
        };
        let ack = value.as_object_mut().and_then(|frame| frame.remove("ack"));

        let reply = match serde_json::from_value::<ClientRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(viewer_id = %self.viewer_id, error = %e, "Unknown signaling request");
                Reply::Error {
                    error: format!("Unknown request: {e}"),
                }
            }
        };

        let ack = ack?;
        serde_json::to_string(&ReplyFrame {
            ack: &ack,
            data: &reply,
        })
        .ok()
    }

    pub async fn handle(&mut self, request: ClientRequest) -> Reply {
        let name = request.name();
        let result = match request {
            ClientRequest::GetRouterRtpCapabilities { stream_id } => {
                self.router_capabilities(&stream_id)
            }
            ClientRequest::JoinStream {
                stream_id,
                rtp_capabilities,
            } => self.join_stream(stream_id, rtp_capabilities).await,
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(&transport_id, dtls_parameters).await,
            ClientRequest::Consume {
                stream_id,
                rtp_capabilities,
            } => self.consume(&stream_id, rtp_capabilities).await,
            ClientRequest::Resume { consumer_id } => Ok(self.resume(&consumer_id).await),
            ClientRequest::RequestKeyFrame { consumer_id } => {
                self.request_key_frame(&consumer_id).await
            }
            ClientRequest::LeaveStream { stream_id } => Ok(self.leave_stream(&stream_id)),
        };

        result.unwrap_or_else(|e| {
            debug!(viewer_id = %self.viewer_id, request = name, error = %e, "Signaling request failed");
            Reply::error(&e)
        })
    }

    fn router_capabilities(&mut self, stream_id: &StreamId) -> SfuResult<Reply> {
        let router = self.manager.get_router(stream_id)?;
        if self.state == SessionState::Connected {
            self.state = SessionState::CapabilitiesExchanged;
        }
        Ok(Reply::Capabilities(router.rtp_capabilities()))
    }

    async fn join_stream(
        &mut self,
        stream_id: StreamId,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> SfuResult<Reply> {
        if self.joined.is_some() {
            self.leave_current();
        }

        let stream = self.manager.stream(&stream_id)?;
        let transport = self
            .manager
            .create_viewer_transport(&self.viewer_id, &stream)
            .await?;
        let viewer = Arc::new(Viewer::new(
            self.viewer_id.clone(),
            Arc::clone(&transport),
            Some(self.notifier.clone()),
        ));

        if let Err(e) = self.manager.attach_viewer(&stream, &viewer) {
            self.manager.remove_viewer_transport(&self.viewer_id);
            return Err(e);
        }

        info!(
            viewer_id = %self.viewer_id,
            stream_id = %stream_id,
            transport_id = %transport.id(),
            "Viewer joined stream"
        );
        self.joined = Some(JoinedStream {
            stream_id,
            viewer,
            rtp_capabilities,
        });
        self.state = SessionState::TransportCreated;

        Ok(Reply::Transport(TransportInfo {
            id: transport.id().clone(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        }))
    }

    async fn connect_transport(
        &mut self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> SfuResult<Reply> {
        let transport = self
            .joined
            .as_ref()
            .map(|j| Arc::clone(j.viewer.transport()))
            .filter(|t| t.id() == transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        transport
            .connect(ConnectParameters {
                dtls_parameters,
                ice_parameters: None,
            })
            .await?;

        self.state = SessionState::TransportConnected;
        debug!(viewer_id = %self.viewer_id, transport_id = %transport_id, "Viewer transport connected");
        Ok(Reply::Status("connected"))
    }

    async fn consume(
        &mut self,
        stream_id: &StreamId,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> SfuResult<Reply> {
        let stream = self.manager.stream(stream_id)?;
        let joined = self
            .joined
            .as_ref()
            .filter(|j| &j.stream_id == stream_id)
            .ok_or_else(|| SfuError::InvalidRequest(format!("not joined to stream {stream_id}")))?;
        let rtp_capabilities = rtp_capabilities
            .or_else(|| joined.rtp_capabilities.clone())
            .ok_or_else(|| SfuError::InvalidRequest("rtpCapabilities required".to_string()))?;

        let viewer = Arc::clone(&joined.viewer);
        let paused = self.manager.media_config().consumer_start_paused;
        let mut granted = Vec::new();

        for producer in stream.producers() {
            if !stream.router().can_consume(producer.id(), &rtp_capabilities) {
                debug!(viewer_id = %self.viewer_id, producer_id = %producer.id(), "Producer not consumable with viewer capabilities");
                continue;
            }

            let consumer = match viewer
                .transport()
                .consume(producer.id(), &rtp_capabilities, paused)
                .await
            {
                Ok(consumer) => consumer,
                Err(EngineError::CannotConsume(_) | EngineError::UnknownProducer(_)) => continue,
                Err(EngineError::Closed { .. }) if stream.is_closed() => break,
                Err(e) => {
                    viewer.close_consumers_for(stream_id);
                    return Err(e.into());
                }
            };

            viewer.add_consumer(stream_id.clone(), Arc::clone(&consumer));
            granted.push(ConsumerInfo {
                id: consumer.id().clone(),
                producer_id: consumer.producer_id().clone(),
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
            });
        }

        // the stream may have been torn down while consumers were being created
        if stream.is_closed() {
            viewer.close_consumers_for(stream_id);
            return Err(SfuError::StreamNotFound(stream_id.clone()));
        }

        info!(
            viewer_id = %self.viewer_id,
            stream_id = %stream_id,
            consumers = granted.len(),
            paused,
            "Viewer consuming"
        );
        self.state = SessionState::Consuming;
        Ok(Reply::Consumers(granted))
    }

    /// Resume a consumer and ask for a keyframe; unknown ids are ignored
    async fn resume(&self, consumer_id: &ConsumerId) -> Reply {
        let Some(consumer) = self
            .joined
            .as_ref()
            .and_then(|j| j.viewer.consumer(consumer_id))
        else {
            debug!(viewer_id = %self.viewer_id, consumer_id = %consumer_id, "Resume for unknown consumer");
            return Reply::Empty;
        };

        if let Err(e) = consumer.resume().await {
            warn!(viewer_id = %self.viewer_id, consumer_id = %consumer_id, error = %e, "Consumer resume failed");
            return Reply::Empty;
        }
        if let Err(e) = consumer.request_key_frame().await {
            warn!(viewer_id = %self.viewer_id, consumer_id = %consumer_id, error = %e, "Keyframe request after resume failed");
        }
        Reply::Empty
    }

    async fn request_key_frame(&self, consumer_id: &ConsumerId) -> SfuResult<Reply> {
        let consumer = self
            .joined
            .as_ref()
            .and_then(|j| j.viewer.consumer(consumer_id))
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;
        consumer.request_key_frame().await?;
        Ok(Reply::Success { success: true })
    }

    fn leave_stream(&mut self, stream_id: &StreamId) -> Reply {
        if self.joined_stream() == Some(stream_id) {
            self.leave_current();
        }
        Reply::Success { success: true }
    }

    fn leave_current(&mut self) {
        let Some(joined) = self.joined.take() else {
            return;
        };

        self.manager.detach_viewer(&joined.stream_id, &self.viewer_id);
        joined.viewer.close();
        self.manager.remove_viewer_transport(&self.viewer_id);
        self.state = SessionState::Connected;

        info!(viewer_id = %self.viewer_id, stream_id = %joined.stream_id, "Viewer left stream");
    }

    /// Release everything this connection holds; later calls do nothing
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.leave_current();
        // a stream teardown may have left registrations the session no longer tracks
        self.manager.detach_viewer_everywhere(&self.viewer_id);
        self.manager.remove_viewer_transport(&self.viewer_id);
        self.state = SessionState::Disconnected;

        info!(viewer_id = %self.viewer_id, "Viewer disconnected");
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
