use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::key::{KeyRecord, RecoveryPoint, StoredResponse};
use super::store::{self, KeyChange, StoreError};
use crate::outbox::{self, StagedJob};
use crate::payments::PaymentGateway;
use crate::users::User;

/// What a phase decided inside its transaction.
#[derive(Debug)]
pub enum Outcome {
    /// Persist the next recovery point and keep executing.
    Advance(RecoveryPoint),
    /// Finish the key with this response; the lease clears with the commit.
    Complete(StoredResponse),
    /// Finish the key and stage a background job in the same commit.
    Defer(StagedJob, StoredResponse),
}

/// Why a phase attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    /// Worth retrying with backoff: serialisation failure, network blip,
    /// deadline overrun. Nothing was committed.
    #[error("transient phase failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Not retryable; surfaced to the caller as-is.
    #[error(transparent)]
    Fatal(anyhow::Error),
}

impl From<sqlx::Error> for PhaseError {
    fn from(e: sqlx::Error) -> Self {
        if store::is_serialization_failure(&e) {
            Self::Transient(anyhow::Error::new(e).context("database serialisation failure"))
        } else {
            Self::Fatal(e.into())
        }
    }
}

impl From<StoreError> for PhaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(db) => db.into(),
            other => Self::Fatal(other.into()),
        }
    }
}

/// Request-scoped collaborators a phase may need besides the transaction.
pub struct PhaseContext<'a> {
    pub gateway: &'a dyn PaymentGateway,
    pub user: &'a User,
    pub origin_ip: Option<&'a str>,
}

/// One transactional step of the request state machine. Domain writes go
/// through the supplied transaction so they commit together with the
/// recovery-point change.
#[async_trait]
pub trait Phase: Send + Sync {
    /// Recovery point this phase runs from.
    fn entry_point(&self) -> RecoveryPoint;

    async fn run(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &KeyRecord,
        ctx: &PhaseContext<'_>,
    ) -> Result<Outcome, PhaseError>;
}

/// Runs one phase inside a serialisable transaction and commits its key
/// update, domain writes, and any staged job atomically. Nothing a phase
/// did survives unless its recovery-point change commits with it.
pub async fn execute(
    pool: &PgPool,
    phase: &dyn Phase,
    key: &KeyRecord,
    ctx: &PhaseContext<'_>,
    deadline: std::time::Duration,
) -> Result<KeyRecord, PhaseError> {
    match tokio::time::timeout(deadline, execute_once(pool, phase, key, ctx)).await {
        Ok(result) => result,
        // The dropped future rolls its transaction back; the attempt simply
        // never happened.
        Err(_) => Err(PhaseError::Transient(anyhow::anyhow!(
            "phase running from `{}` exceeded its {deadline:?} deadline",
            phase.entry_point()
        ))),
    }
}

async fn execute_once(
    pool: &PgPool,
    phase: &dyn Phase,
    key: &KeyRecord,
    ctx: &PhaseContext<'_>,
) -> Result<KeyRecord, PhaseError> {
    let mut tx = store::begin_serializable(pool).await?;
    let outcome = phase.run(&mut tx, key, ctx).await?;

    let change = match outcome {
        Outcome::Advance(next) => KeyChange {
            recovery_point: next,
            locked_at: key.locked_at,
            response: None,
        },
        Outcome::Complete(response) => KeyChange {
            recovery_point: RecoveryPoint::Finished,
            locked_at: None,
            response: Some(response),
        },
        Outcome::Defer(job, response) => {
            outbox::enqueue(&mut tx, &job).await?;
            KeyChange {
                recovery_point: RecoveryPoint::Finished,
                locked_at: None,
                response: Some(response),
            }
        }
    };
    let updated = store::update(&mut tx, key, change).await?;
    tx.commit().await?;
    Ok(updated)
}
