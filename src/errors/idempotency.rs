use actix_web::{ResponseError, http::StatusCode};

use crate::idempotency::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum IdempotencyError {
    #[error("Missing Idempotency-Key header")]
    MissingKey,
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),
    #[error("This idempotency key was first used with different request parameters")]
    RequestMismatch,
    #[error("An earlier request with this idempotency key is still in progress")]
    InProgress,
    #[error("Retries exhausted, try again shortly")]
    RetriesExhausted(#[source] anyhow::Error),
    #[error("Stored idempotency state is unusable: {0}")]
    Corruption(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<StoreError> for IdempotencyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(db) => Self::Database(db),
            StoreError::Corrupted(message) => Self::Corruption(message),
            StoreError::Conflict => {
                Self::Unexpected(anyhow::anyhow!("idempotency key insert conflicted after retry"))
            }
            // A guard refused an impossible transition; the row is suspect.
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl ResponseError for IdempotencyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingKey | Self::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Self::RequestMismatch | Self::InProgress => StatusCode::CONFLICT,
            Self::RetriesExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Corruption(_) | Self::Database(_) | Self::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
