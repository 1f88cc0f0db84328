//! HTTP error surface.
//!
//! Every non-2xx response carries the same JSON body:
//! `{ "type": string, "message": string, "httpStatus": number }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use etre_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// The wire error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(rename = "httpStatus")]
    pub http_status: u16,
}

/// An error on its way out of the API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError(pub Error);

/// Result alias for route handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidQuery
        | ErrorKind::InvalidParam
        | ErrorKind::MissingParam
        | ErrorKind::NoContent
        | ErrorKind::InvalidContent => StatusCode::BAD_REQUEST,

        ErrorKind::EntityNotFound | ErrorKind::EndpointNotFound => StatusCode::NOT_FOUND,

        ErrorKind::DuplicateEntity => StatusCode::CONFLICT,

        ErrorKind::CdcDisabled => StatusCode::NOT_IMPLEMENTED,

        ErrorKind::AuthError => StatusCode::UNAUTHORIZED,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,

        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_code(self.0.kind)
    }

    pub fn body(&self) -> ErrorBody {
        error_body(&self.0)
    }
}

pub fn error_body(error: &Error) -> ErrorBody {
    ErrorBody {
        kind: error.kind,
        message: error.message.clone(),
        http_status: status_code(error.kind).as_u16(),
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.kind == ErrorKind::InternalError {
            tracing::error!(error = %self.0, "internal error");
        }
        (self.status(), Json(self.body())).into_response()
    }
}
