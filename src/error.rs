use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::api::responses::MessageResponse;

/// Message returned to clients whose idempotency header is missing or malformed.
pub const INVALID_TOKEN_MESSAGE: &str = "invalid idempotence header key";

pub const IN_PROGRESS_MESSAGE: &str =
    "request with this idempotence header key is already being processed";

pub const STORE_UNAVAILABLE_MESSAGE: &str = "idempotency store unavailable";

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Reason an idempotency token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("idempotency header is missing")]
    Missing,

    #[error("idempotency header is not valid ASCII")]
    NotUtf8,

    #[error("expected 26 characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("timestamp component overflows 48 bits")]
    TimestampOverflow,

    #[error("timestamp component lies in the future")]
    FutureTimestamp,
}

/// Outcomes the request gate converts into HTTP responses.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("invalid idempotency token: {0}")]
    InvalidToken(#[from] TokenRejection),

    #[error("idempotency store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("idempotency key is already being processed")]
    InProgress,
}

impl IdempotencyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IdempotencyError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            IdempotencyError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IdempotencyError::InProgress => StatusCode::CONFLICT,
        }
    }

    /// Client-facing message. Rejection details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            IdempotencyError::InvalidToken(_) => INVALID_TOKEN_MESSAGE,
            IdempotencyError::StoreUnavailable(_) => STORE_UNAVAILABLE_MESSAGE,
            IdempotencyError::InProgress => IN_PROGRESS_MESSAGE,
        }
    }
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(MessageResponse::new(self.public_message())),
        )
            .into_response()
    }
}
