//! Error types shared across the query gateway
//! Every user-visible failure is one of the structured kinds below; the
//! axum mapping turns kinds into HTTP statuses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Position/field information attached to validation errors
#[derive(Debug, Clone, Serialize, Default)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub col: Option<usize>,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("too many active queries: {0}")]
    TooManyQueries(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation {
            message: msg.into(),
            details: Vec::new(),
        }
    }

    pub fn validation_with<S: Into<String>>(msg: S, details: Vec<ErrorDetail>) -> Self {
        Error::Validation {
            message: msg.into(),
            details,
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }

    pub fn backend_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::BackendUnavailable(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Stable kind identifier surfaced in error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::TooManyQueries(_) => "too_many_requests",
            Error::BackendUnavailable(_) | Error::Backend(_) => "backend",
            Error::Internal(_) | Error::Config(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            // 499 Client Closed Request, nginx convention
            Error::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::TooManyQueries(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::BackendUnavailable(_) | Error::Backend(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            Error::Validation { details, .. } if !details.is_empty() => {
                Some(details.clone())
            }
            _ => None,
        };
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(details) = details {
            error["details"] = serde_json::to_value(details).unwrap_or_default();
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<clickhouse::error::Error> for Error {
    fn from(err: clickhouse::error::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() {
            Error::BackendUnavailable(err.to_string())
        } else {
            Error::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {err}"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
