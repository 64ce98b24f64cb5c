//! Uniform JSON error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::supervisor::SupervisorError;

/// Errors surfaced to HTTP callers as `{success: false, error, example?}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The system switch is off.
    #[error("Sistem belum diaktifkan")]
    Disabled,

    /// Missing or invalid query parameter.
    #[error("{error}")]
    BadRequest {
        error: &'static str,
        example: Option<&'static str>,
    },

    #[error("WhatsApp belum terkoneksi")]
    NotConnected,

    /// Anything else; the message is passed through as-is.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(error: &'static str, example: &'static str) -> Self {
        Self::BadRequest {
            error,
            example: Some(example),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Disabled | Self::NotConnected | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::NotConnected => Self::NotConnected,
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    example: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let example = match &self {
            Self::BadRequest { example, .. } => *example,
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            example,
        };
        (self.status(), Json(body)).into_response()
    }
}
