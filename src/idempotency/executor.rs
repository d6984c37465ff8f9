use actix_web::http::StatusCode;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::key::{KeyRecord, RecoveryPoint, StoredResponse};
use super::lock;
use super::phase::{self, Outcome, Phase, PhaseContext, PhaseError};
use crate::configuration::IdempotencySettings;
use crate::errors::IdempotencyError;
use crate::outbox::StagedJob;
use crate::payments::{ChargeOutcome, ChargeRequest, PaymentError};
use crate::rides::{self, AuditRecord, RIDE_FARE_CENTS, RideParams};

/// Tag → phase table. Adding a recovery point means adding a row here; the
/// loop below never changes.
static PHASES: &[&dyn Phase] = &[&CreateRide, &ChargeCard, &StageReceipt];

fn phase_for(point: RecoveryPoint) -> Option<&'static dyn Phase> {
    PHASES.iter().copied().find(|phase| phase.entry_point() == point)
}

/// Drives a leased key forward until it is finished, then hands back the
/// stored response.
pub struct Executor<'a> {
    pool: &'a PgPool,
    settings: &'a IdempotencySettings,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool, settings: &'a IdempotencySettings) -> Self {
        Self { pool, settings }
    }

    #[tracing::instrument(
        name = "Run idempotent request",
        skip_all,
        fields(key_id = key.id, recovery_point = %key.recovery_point)
    )]
    pub async fn run(
        &self,
        mut key: KeyRecord,
        ctx: &PhaseContext<'_>,
    ) -> Result<StoredResponse, IdempotencyError> {
        loop {
            if key.is_finished() {
                return key.response.ok_or_else(|| {
                    IdempotencyError::Corruption("finished key has no stored response".to_string())
                });
            }
            let Some(phase) = phase_for(key.recovery_point) else {
                return Err(IdempotencyError::Corruption(format!(
                    "no phase runs from recovery point `{}`",
                    key.recovery_point
                )));
            };
            match self.run_phase(phase, &key, ctx).await {
                Ok(updated) => key = updated,
                Err(error) => {
                    // Progress stays wherever the last commit left it; give
                    // the lease back so a retry does not wait out the TTL.
                    if let Err(release_error) = lock::release(self.pool, key.id).await {
                        tracing::error!(
                            error = ?release_error,
                            key_id = key.id,
                            "Failed to release the idempotency lease"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn run_phase(
        &self,
        phase: &dyn Phase,
        key: &KeyRecord,
        ctx: &PhaseContext<'_>,
    ) -> Result<KeyRecord, IdempotencyError> {
        let deadline = self.settings.phase_deadline();
        let mut attempt: u32 = 1;
        loop {
            match phase::execute(self.pool, phase, key, ctx, deadline).await {
                Ok(updated) => {
                    tracing::info!(
                        key_id = key.id,
                        from = %key.recovery_point,
                        to = %updated.recovery_point,
                        "Phase committed"
                    );
                    return Ok(updated);
                }
                Err(PhaseError::Fatal(error)) => return Err(IdempotencyError::Unexpected(error)),
                Err(PhaseError::Transient(error)) => {
                    if attempt >= self.settings.phase_max_attempts {
                        return Err(IdempotencyError::RetriesExhausted(error));
                    }
                    let delay = self.settings.phase_backoff(attempt);
                    tracing::warn!(
                        error = ?error,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient phase failure, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Records the ride and its audit trail.
struct CreateRide;

#[async_trait]
impl Phase for CreateRide {
    fn entry_point(&self) -> RecoveryPoint {
        RecoveryPoint::Started
    }

    async fn run(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &KeyRecord,
        ctx: &PhaseContext<'_>,
    ) -> Result<Outcome, PhaseError> {
        let params: RideParams = match serde_json::from_value(key.request_params.clone()) {
            Ok(params) => params,
            Err(e) => {
                return Ok(Outcome::Complete(StoredResponse::error(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &format!("invalid ride parameters: {e}"),
                )));
            }
        };
        if let Err(reason) = params.validate() {
            return Ok(Outcome::Complete(StoredResponse::error(
                StatusCode::UNPROCESSABLE_ENTITY,
                &reason,
            )));
        }

        // The unique index on idempotency_key_id makes re-running this phase
        // a lookup rather than a second ride.
        let ride = match rides::find_by_key_id(tx, key.id).await? {
            Some(existing) => existing,
            None => rides::insert_ride(tx, key.user_id, key.id, &params).await?,
        };
        rides::insert_audit_record(
            tx,
            &AuditRecord {
                action: "ride.created",
                data: &key.request_params,
                origin_ip: ctx.origin_ip,
                resource_type: "ride",
                resource_id: ride.id,
                user_id: key.user_id,
            },
        )
        .await?;
        Ok(Outcome::Advance(RecoveryPoint::RideCreated))
    }
}

/// Charges the rider through the payment processor, keyed so the processor
/// deduplicates retries on its side.
struct ChargeCard;

#[async_trait]
impl Phase for ChargeCard {
    fn entry_point(&self) -> RecoveryPoint {
        RecoveryPoint::RideCreated
    }

    async fn run(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &KeyRecord,
        ctx: &PhaseContext<'_>,
    ) -> Result<Outcome, PhaseError> {
        let ride = rides::find_by_key_id(tx, key.id).await?.ok_or_else(|| {
            PhaseError::Fatal(anyhow::anyhow!(
                "no ride recorded for idempotency key {}",
                key.id
            ))
        })?;

        let charge = ChargeRequest {
            amount_cents: RIDE_FARE_CENTS,
            currency: "usd",
            customer_email: &ctx.user.email,
        };
        match ctx.gateway.charge(&key.charge_token(), &charge).await {
            Ok(ChargeOutcome::Success(receipt)) => {
                rides::record_charge(tx, ride.id, &receipt.charge_id).await?;
                Ok(Outcome::Advance(RecoveryPoint::ChargeCreated))
            }
            Ok(ChargeOutcome::Declined { reason }) => Ok(Outcome::Complete(StoredResponse::error(
                StatusCode::PAYMENT_REQUIRED,
                &format!("card declined: {reason}"),
            ))),
            Err(PaymentError::Transient(error)) => Err(PhaseError::Transient(error)),
        }
    }
}

/// Stages the receipt notification and finishes the key with the ride.
struct StageReceipt;

#[async_trait]
impl Phase for StageReceipt {
    fn entry_point(&self) -> RecoveryPoint {
        RecoveryPoint::ChargeCreated
    }

    async fn run(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &KeyRecord,
        _ctx: &PhaseContext<'_>,
    ) -> Result<Outcome, PhaseError> {
        let ride = rides::find_by_key_id(tx, key.id).await?.ok_or_else(|| {
            PhaseError::Fatal(anyhow::anyhow!(
                "no ride recorded for idempotency key {}",
                key.id
            ))
        })?;

        let job = StagedJob {
            name: "send_ride_receipt".to_string(),
            args: serde_json::json!({
                "ride_id": ride.id,
                "user_id": key.user_id,
                "amount_cents": RIDE_FARE_CENTS,
                "currency": "usd",
            }),
        };
        let response = match StoredResponse::json(StatusCode::CREATED, &ride) {
            Ok(response) => response,
            // terminal: the ride and charge exist, so freeze the failure
            // rather than re-running paid-for work
            Err(e) => {
                return Ok(Outcome::Complete(StoredResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("could not render the ride receipt: {e}"),
                )));
            }
        };
        Ok(Outcome::Defer(job, response))
    }
}
