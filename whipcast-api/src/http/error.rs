// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use whipcast_sfu::SfuError;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
///
/// Rendered as a plain-text body, which is what WHIP clients expect.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Convert SFU errors to HTTP errors
impl From<SfuError> for AppError {
    fn from(err: SfuError) -> Self {
        match err {
            SfuError::MalformedOffer(_) | SfuError::InvalidRequest(_) => {
                Self::bad_request(err.to_string())
            }
            SfuError::AlreadyPublishing(_) => Self::conflict(err.to_string()),
            SfuError::StreamNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ConsumerNotFound(_) => Self::not_found(err.to_string()),
            SfuError::AlreadyExists(_)
            | SfuError::TransportFailure(_)
            | SfuError::WorkerFailure(_)
            | SfuError::Engine(_) => {
                tracing::error!(error = %err, "Request failed");
                Self::internal_server_error(err.to_string())
            }
        }
    }
}
