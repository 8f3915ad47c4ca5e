//! Error types for the receiver
//!
//! Every error maps to an HTTP status and a JSON body. Internal details are
//! logged, never returned to the client.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No file uploaded")]
    NoFile,

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoFile | Self::InvalidName(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Multipart(e) => e.status(),
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the client
    fn public_message(&self) -> String {
        match self {
            Self::Io(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for SinkError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}
