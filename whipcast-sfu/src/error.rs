use thiserror::Error;

use crate::engine::EngineError;
use crate::sdp::SdpError;
use crate::types::{ConsumerId, StreamId, TransportId};

pub type SfuResult<T> = std::result::Result<T, SfuError>;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Malformed offer: {0}")]
    MalformedOffer(String),

    #[error("Stream not found")]
    StreamNotFound(StreamId),

    #[error("Router for stream {0} already exists")]
    AlreadyExists(StreamId),

    #[error("Stream {0} is already being published")]
    AlreadyPublishing(StreamId),

    #[error("Transport not found")]
    TransportNotFound(TransportId),

    #[error("Consumer not found")]
    ConsumerNotFound(ConsumerId),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<SdpError> for SfuError {
    fn from(err: SdpError) -> Self {
        Self::MalformedOffer(err.to_string())
    }
}
