use actix_web::HttpRequest;
use actix_web::http::header;
use sqlx::PgPool;

use crate::errors::RideError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
}

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as("SELECT id, email FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await
}

/// Riders identify themselves with their email in the `Authorization`
/// header.
pub async fn authenticate(pool: &PgPool, request: &HttpRequest) -> Result<User, RideError> {
    let email = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(RideError::AuthRequired)?;
    find_by_email(pool, email)
        .await?
        .ok_or(RideError::UnknownUser)
}
