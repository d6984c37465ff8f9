use actix_web::http::StatusCode;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::key::{IdempotencyKey, KeyRecord, RecoveryPoint, StoredResponse};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an idempotency key already exists for this user and key")]
    Conflict,
    #[error("a finished idempotency key cannot be updated")]
    AlreadyFinished,
    #[error("recovery point cannot move from `{from}` to `{to}`")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("a response is stored exactly when a key finishes")]
    ResponseDiscipline,
    #[error("corrupted idempotency key row: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const KEY_COLUMNS: &str = "id, created_at, user_id, key, request_method, request_path, \
     request_params, last_run_at, locked_at, recovery_point, response_code, response_body";

#[derive(sqlx::FromRow)]
struct KeyRow {
    id: i64,
    created_at: DateTime<Utc>,
    user_id: i64,
    key: String,
    request_method: String,
    request_path: String,
    request_params: serde_json::Value,
    last_run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    recovery_point: String,
    response_code: Option<i32>,
    response_body: Option<String>,
}

impl TryFrom<KeyRow> for KeyRecord {
    type Error = StoreError;

    fn try_from(row: KeyRow) -> Result<Self, StoreError> {
        let recovery_point: RecoveryPoint = row
            .recovery_point
            .parse()
            .map_err(|e: super::key::UnknownRecoveryPoint| StoreError::Corrupted(e.to_string()))?;

        let response = match (row.response_code, row.response_body) {
            (Some(code), Some(body)) => {
                let status = u16::try_from(code)
                    .ok()
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .ok_or_else(|| {
                        StoreError::Corrupted(format!("invalid stored response status {code}"))
                    })?;
                Some(StoredResponse { status, body })
            }
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupted(
                    "response code and body must be stored together".to_string(),
                ));
            }
        };
        if response.is_some() != (recovery_point == RecoveryPoint::Finished) {
            return Err(StoreError::Corrupted(
                "a stored response must accompany exactly the finished state".to_string(),
            ));
        }

        Ok(Self {
            id: row.id,
            created_at: row.created_at,
            user_id: row.user_id,
            key: row.key,
            request_method: row.request_method,
            request_path: row.request_path,
            request_params: row.request_params,
            last_run_at: row.last_run_at,
            locked_at: row.locked_at,
            recovery_point,
            response,
        })
    }
}

/// Fields frozen when a key row is first written.
#[derive(Debug)]
pub struct NewKeyRecord<'a> {
    pub user_id: i64,
    pub key: &'a IdempotencyKey,
    pub request_method: &'a str,
    pub request_path: &'a str,
    pub request_params: &'a serde_json::Value,
}

/// Mutable portion of a key row. `last_run_at` is stamped server-side on
/// every update.
#[derive(Debug, Clone)]
pub struct KeyChange {
    pub recovery_point: RecoveryPoint,
    pub locked_at: Option<DateTime<Utc>>,
    pub response: Option<StoredResponse>,
}

/// Key-mutating transactions read the row, branch on it, and write back,
/// so they run serialisable.
pub async fn begin_serializable(
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

pub(crate) fn is_serialization_failure(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001" || code == "40P01")
}

/// Looks a key up by its owning user and token. Absence is reported as
/// `None`, not an error.
pub async fn find(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    key: &IdempotencyKey,
) -> Result<Option<KeyRecord>, StoreError> {
    let row: Option<KeyRow> = sqlx::query_as(&format!(
        "SELECT {KEY_COLUMNS} FROM idempotency_keys WHERE user_id = $1 AND key = $2",
    ))
    .bind(user_id)
    .bind(key.as_ref())
    .fetch_optional(&mut **tx)
    .await?;
    row.map(KeyRecord::try_from).transpose()
}

/// Inserts a fresh row at `started` with the lease held from birth. A
/// duplicate `(user_id, key)` fails with `Conflict`; callers re-find.
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    new: &NewKeyRecord<'_>,
) -> Result<KeyRecord, StoreError> {
    let row: KeyRow = sqlx::query_as(&format!(
        "INSERT INTO idempotency_keys \
             (user_id, key, request_method, request_path, request_params, \
              created_at, last_run_at, locked_at, recovery_point) \
         VALUES ($1, $2, $3, $4, $5, now(), now(), now(), $6) \
         RETURNING {KEY_COLUMNS}",
    ))
    .bind(new.user_id)
    .bind(new.key.as_ref())
    .bind(new.request_method)
    .bind(new.request_path)
    .bind(new.request_params)
    .bind(RecoveryPoint::Started.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| {
        if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
            StoreError::Conflict
        } else {
            StoreError::Database(e)
        }
    })?;
    row.try_into()
}

/// Rewrites the mutable fields of `current` and returns the post-update
/// row. Changes that would rewind progress, touch a finished key, or break
/// the response pairing are rejected before any SQL runs.
pub async fn update(
    tx: &mut Transaction<'_, Postgres>,
    current: &KeyRecord,
    change: KeyChange,
) -> Result<KeyRecord, StoreError> {
    validate_change(current, &change)?;

    let (code, body) = match &change.response {
        Some(response) => (
            Some(i32::from(response.status.as_u16())),
            Some(response.body.as_str()),
        ),
        None => (None, None),
    };
    let row: KeyRow = sqlx::query_as(&format!(
        "UPDATE idempotency_keys \
         SET recovery_point = $2, locked_at = $3, last_run_at = now(), \
             response_code = $4, response_body = $5 \
         WHERE id = $1 \
         RETURNING {KEY_COLUMNS}",
    ))
    .bind(current.id)
    .bind(change.recovery_point.as_str())
    .bind(change.locked_at)
    .bind(code)
    .bind(body)
    .fetch_one(&mut **tx)
    .await?;
    row.try_into()
}

fn validate_change(current: &KeyRecord, change: &KeyChange) -> Result<(), StoreError> {
    if current.recovery_point == RecoveryPoint::Finished {
        return Err(StoreError::AlreadyFinished);
    }
    let allowed = change.recovery_point == current.recovery_point
        || change.recovery_point == RecoveryPoint::Finished
        || Some(change.recovery_point) == current.recovery_point.next();
    if !allowed {
        return Err(StoreError::InvalidTransition {
            from: current.recovery_point.as_str(),
            to: change.recovery_point.as_str(),
        });
    }
    if change.response.is_some() != (change.recovery_point == RecoveryPoint::Finished) {
        return Err(StoreError::ResponseDiscipline);
    }
    Ok(())
}
