//! Error taxonomy shared by the store, the CDC pipeline, and the API.
//!
//! Each kind has a stable kebab-case wire identifier; the HTTP layer maps
//! kinds to status codes and serializes `{type, message, httpStatus}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error categories surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Selector failed to parse
    InvalidQuery,

    /// Parameter value invalid (unknown type, caller-set meta-label, ...)
    InvalidParam,

    /// Required parameter absent
    MissingParam,

    /// Empty body where entities were required
    NoContent,

    /// Body not parseable as the expected shape
    InvalidContent,

    /// Lookup by id missed
    EntityNotFound,

    /// Unknown route
    EndpointNotFound,

    /// A write violated a unique index
    DuplicateEntity,

    /// Operation requires CDC which is off
    CdcDisabled,

    /// Authentication failed
    AuthError,

    /// Caller is authenticated but not allowed
    AccessDenied,

    /// Anything else, including database connectivity
    InternalError,
}

impl ErrorKind {
    /// The wire identifier, e.g. `duplicate-entity`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "invalid-query",
            ErrorKind::InvalidParam => "invalid-param",
            ErrorKind::MissingParam => "missing-param",
            ErrorKind::NoContent => "no-content",
            ErrorKind::InvalidContent => "invalid-content",
            ErrorKind::EntityNotFound => "entity-not-found",
            ErrorKind::EndpointNotFound => "endpoint-not-found",
            ErrorKind::DuplicateEntity => "duplicate-entity",
            ErrorKind::CdcDisabled => "cdc-disabled",
            ErrorKind::AuthError => "auth-error",
            ErrorKind::AccessDenied => "access-denied",
            ErrorKind::InternalError => "internal-error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error with its wire category and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery, message)
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParam, message)
    }

    pub fn missing_param(param: &str) -> Self {
        Self::new(ErrorKind::MissingParam, format!("missing parameter: {}", param))
    }

    pub fn no_content() -> Self {
        Self::new(ErrorKind::NoContent, "no entities provided")
    }

    pub fn invalid_content(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidContent, message)
    }

    pub fn entity_not_found(id: &str) -> Self {
        Self::new(ErrorKind::EntityNotFound, format!("entity {} not found", id))
    }

    pub fn duplicate_entity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateEntity, message)
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
