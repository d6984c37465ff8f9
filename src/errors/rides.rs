use actix_web::{ResponseError, http::StatusCode};

use super::IdempotencyError;

#[derive(thiserror::Error, Debug)]
pub enum RideError {
    #[error("Authentication required")]
    AuthRequired,
    #[error("Unknown user")]
    UnknownUser,
    #[error("Ride not found")]
    NotFound,
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ResponseError for RideError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRequired | Self::UnknownUser => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Idempotency(e) => e.status_code(),
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
