use chrono::{Duration, Utc};
use sqlx::PgPool;

use super::key::{IdempotencyKey, KeyRecord, RecoveryPoint};
use super::store::{self, KeyChange, NewKeyRecord, StoreError};
use crate::errors::IdempotencyError;

// Lost insert races and serialisation failures restart the protocol; more
// than a couple of restarts means real contention and the caller gets a 503.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// How an inbound request relates to the key it presented.
#[derive(Debug)]
pub enum Acquisition {
    /// First request for this key; the row was inserted with the lease held.
    New(KeyRecord),
    /// Existing unfinished key whose lease was free or expired; the lease is
    /// now ours.
    Resumed(KeyRecord),
    /// The key already finished; the stored response replays without
    /// executing anything.
    Replay(KeyRecord),
}

/// Frozen identity of an inbound request, checked against an existing row.
#[derive(Debug)]
pub struct InboundRequest<'a> {
    pub user_id: i64,
    pub key: &'a IdempotencyKey,
    pub method: &'a str,
    pub path: &'a str,
    pub params: &'a serde_json::Value,
}

impl InboundRequest<'_> {
    fn matches(&self, key: &KeyRecord) -> bool {
        key.request_method == self.method
            && key.request_path == self.path
            && key.request_params == *self.params
    }
}

/// Runs the acquire protocol: insert-or-find the key row, validate the
/// frozen request fields, and take the lease unless a live executor holds
/// it. A lease older than `lease_ttl` belonged to a crashed executor and is
/// stolen.
#[tracing::instrument(
    name = "Acquire idempotency key",
    skip(pool, request, lease_ttl),
    fields(user_id = request.user_id, idempotency_key = %request.key)
)]
pub async fn acquire(
    pool: &PgPool,
    request: &InboundRequest<'_>,
    lease_ttl: Duration,
) -> Result<Acquisition, IdempotencyError> {
    for _ in 0..ACQUIRE_ATTEMPTS {
        match try_acquire(pool, request, lease_ttl).await? {
            Some(acquisition) => return Ok(acquisition),
            None => continue,
        }
    }
    Err(IdempotencyError::RetriesExhausted(anyhow::anyhow!(
        "could not acquire the idempotency key under contention"
    )))
}

/// One pass of the protocol. `Ok(None)` means the pass lost a race and the
/// caller should start over.
async fn try_acquire(
    pool: &PgPool,
    request: &InboundRequest<'_>,
    lease_ttl: Duration,
) -> Result<Option<Acquisition>, IdempotencyError> {
    let mut tx = store::begin_serializable(pool).await?;

    let existing = match store::find(&mut tx, request.user_id, request.key).await {
        Ok(existing) => existing,
        Err(StoreError::Database(e)) if store::is_serialization_failure(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let Some(key) = existing else {
        let new = NewKeyRecord {
            user_id: request.user_id,
            key: request.key,
            request_method: request.method,
            request_path: request.path,
            request_params: request.params,
        };
        return match store::insert(&mut tx, &new).await {
            Ok(inserted) => match tx.commit().await {
                Ok(()) => Ok(Some(Acquisition::New(inserted))),
                Err(e) if store::is_serialization_failure(&e) => Ok(None),
                Err(e) => Err(e.into()),
            },
            Err(StoreError::Conflict) => Ok(None),
            Err(StoreError::Database(e)) if store::is_serialization_failure(&e) => Ok(None),
            Err(e) => Err(e.into()),
        };
    };

    if !request.matches(&key) {
        return Err(IdempotencyError::RequestMismatch);
    }
    if key.is_finished() {
        return Ok(Some(Acquisition::Replay(key)));
    }

    let now = Utc::now();
    if let Some(held_at) = key.locked_at {
        if now.signed_duration_since(held_at) < lease_ttl {
            return Err(IdempotencyError::InProgress);
        }
        tracing::warn!(key_id = key.id, "Stealing an expired idempotency lease");
    }

    let change = KeyChange {
        recovery_point: key.recovery_point,
        locked_at: Some(now),
        response: None,
    };
    let resumed = match store::update(&mut tx, &key, change).await {
        Ok(resumed) => resumed,
        Err(StoreError::Database(e)) if store::is_serialization_failure(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match tx.commit().await {
        Ok(()) => Ok(Some(Acquisition::Resumed(resumed))),
        Err(e) if store::is_serialization_failure(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Drops a lease without touching progress, so the next request resumes
/// immediately instead of waiting out the TTL. Finished keys keep their
/// cleared lease as written by the final phase.
pub async fn release(pool: &PgPool, key_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE idempotency_keys SET locked_at = NULL WHERE id = $1 AND recovery_point <> $2")
        .bind(key_id)
        .bind(RecoveryPoint::Finished.as_str())
        .execute(pool)
        .await?;
    Ok(())
}
