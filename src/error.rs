use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::models::JsonOutput;
use crate::oracle::OracleError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound(what.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LedgerError::Validation { .. } => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::Oracle(e) => match e {
                OracleError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
                OracleError::Unavailable(_) | OracleError::RateLimited => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                OracleError::Malformed(_) | OracleError::Transport(_) => StatusCode::BAD_GATEWAY,
            },
            LedgerError::Storage(e) if is_constraint_violation(e) => StatusCode::CONFLICT,
            LedgerError::Storage(_) | LedgerError::Encoding(_) | LedgerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl From<JsonRejection> for LedgerError {
    fn from(rejection: JsonRejection) -> Self {
        LedgerError::validation("body", rejection.body_text())
    }
}

impl From<QueryRejection> for LedgerError {
    fn from(rejection: QueryRejection) -> Self {
        LedgerError::validation("query", rejection.body_text())
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = match &self {
            LedgerError::Validation { field, message } => {
                JsonOutput::<()>::err(message.clone()).with_field(field)
            }
            // Storage internals stay in the log
            LedgerError::Storage(_) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                JsonOutput::<()>::err("Storage failure, please retry")
            }
            other => JsonOutput::<()>::err(other.to_string()),
        };

        (status, Json(body)).into_response()
    }
}
