use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::queue::QueueError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("{0}")]
    BadGateway(String),

    #[error("problem reading request body: {0}")]
    BodyRead(String),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] EnvelopeError),

    #[error("Buffer queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::BodyRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // A bad-gateway response carries the raw upstream error text; everything
        // else is rendered in the diagnostic shape ClickHouse clients expect.
        let body = match &self {
            RelayError::BadGateway(message) => message.clone(),
            other => format!(
                "Code: {}, e.displayText() = clickhouse-relay: {}",
                status.as_u16(),
                other
            ),
        };

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
