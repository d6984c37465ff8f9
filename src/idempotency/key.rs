use std::fmt;

use actix_web::HttpRequest;
use actix_web::http::StatusCode;
use actix_web::http::header::ContentType;
use chrono::{DateTime, Utc};

use crate::errors::IdempotencyError;

const MAX_KEY_LENGTH: usize = 100;

/// Client-supplied token scoping a request to exactly one effect per
/// `(user, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Pulls the `Idempotency-Key` header off an inbound request.
    pub fn from_request(request: &HttpRequest) -> Result<Self, IdempotencyError> {
        let raw = request
            .headers()
            .get("Idempotency-Key")
            .and_then(|value| value.to_str().ok())
            .ok_or(IdempotencyError::MissingKey)?;
        Self::try_from(raw.to_string()).map_err(|e| IdempotencyError::InvalidKey(e.to_string()))
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            anyhow::bail!("The idempotency key cannot be empty.");
        }
        if s.len() > MAX_KEY_LENGTH {
            anyhow::bail!("The idempotency key must be at most {MAX_KEY_LENGTH} characters long.");
        }
        Ok(Self(s))
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable marker of how far a keyed request has progressed. Declaration
/// order is the canonical execution order; `finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryPoint {
    Started,
    RideCreated,
    ChargeCreated,
    Finished,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown recovery point tag `{0}`")]
pub struct UnknownRecoveryPoint(String);

impl RecoveryPoint {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::RideCreated => "ride_created",
            Self::ChargeCreated => "charge_created",
            Self::Finished => "finished",
        }
    }

    /// The point a successful phase commit moves to, or `None` from the
    /// terminal point.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Started => Some(Self::RideCreated),
            Self::RideCreated => Some(Self::ChargeCreated),
            Self::ChargeCreated => Some(Self::Finished),
            Self::Finished => None,
        }
    }
}

// The tag set is closed; rows carrying anything else are corrupt, never
// coerced to a default.
impl std::str::FromStr for RecoveryPoint {
    type Err = UnknownRecoveryPoint;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "started" => Ok(Self::Started),
            "ride_created" => Ok(Self::RideCreated),
            "charge_created" => Ok(Self::ChargeCreated),
            "finished" => Ok(Self::Finished),
            other => Err(UnknownRecoveryPoint(other.to_string())),
        }
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response pair persisted when a key finishes. Code and body travel
/// together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub body: String,
}

impl StoredResponse {
    pub fn json<T: serde::Serialize>(
        status: StatusCode,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status,
            body: serde_json::to_string(value)?,
        })
    }

    #[must_use]
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    /// Replays the stored bytes as-is; every stored body is JSON.
    #[must_use]
    pub fn into_http_response(self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status)
            .content_type(ContentType::json())
            .body(self.body)
    }
}

/// One durable idempotency-key row. Request fields are frozen at insert;
/// only progress, lease, and response fields ever change.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
    pub key: String,
    pub request_method: String,
    pub request_path: String,
    pub request_params: serde_json::Value,
    pub last_run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub recovery_point: RecoveryPoint,
    pub response: Option<StoredResponse>,
}

impl KeyRecord {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.recovery_point == RecoveryPoint::Finished
    }

    /// Token forwarded to the payment processor so a re-run of the charge
    /// phase cannot charge twice. Derived from the key row alone; no clock
    /// or per-request material.
    #[must_use]
    pub fn charge_token(&self) -> String {
        format!("ride-{}-{}", self.user_id, self.key)
    }
}
