use actix_web::{HttpRequest, HttpResponse, web};
use sqlx::PgPool;

use crate::configuration::IdempotencySettings;
use crate::errors::{IdempotencyError, RideError};
use crate::idempotency::{
    Acquisition, Executor, IdempotencyKey, InboundRequest, PhaseContext, acquire,
};
use crate::payments::PaymentGateway;
use crate::rides::RideParams;
use crate::users;

#[tracing::instrument(
    name = "Create ride",
    skip(params, pool, gateway, settings, request),
    fields(
        user_id = tracing::field::Empty,
        idempotency_key = tracing::field::Empty
    )
)]
pub async fn create_ride(
    params: web::Json<RideParams>,
    pool: web::Data<PgPool>,
    gateway: web::Data<dyn PaymentGateway>,
    settings: web::Data<IdempotencySettings>,
    request: HttpRequest,
) -> Result<HttpResponse, RideError> {
    let user = users::authenticate(pool.get_ref(), &request).await?;
    tracing::Span::current().record("user_id", user.id);

    let key = IdempotencyKey::from_request(&request)?;
    tracing::Span::current().record("idempotency_key", key.as_ref());

    // Canonical form of the body; this is what gets frozen and compared on
    // retries.
    let request_params = serde_json::to_value(&params.0)
        .map_err(|e| IdempotencyError::Unexpected(e.into()))?;

    let inbound = InboundRequest {
        user_id: user.id,
        key: &key,
        method: request.method().as_str(),
        path: request.path(),
        params: &request_params,
    };
    let key_record = match acquire(pool.get_ref(), &inbound, settings.lease_ttl()).await? {
        Acquisition::Replay(finished) => {
            tracing::info!("Replaying stored response for a finished idempotency key");
            let response = finished.response.ok_or_else(|| {
                IdempotencyError::Corruption("finished key has no stored response".to_string())
            })?;
            return Ok(response.into_http_response());
        }
        Acquisition::New(record) | Acquisition::Resumed(record) => record,
    };

    let origin_ip = request.peer_addr().map(|addr| addr.ip().to_string());
    let ctx = PhaseContext {
        gateway: gateway.get_ref(),
        user: &user,
        origin_ip: origin_ip.as_deref(),
    };
    let executor = Executor::new(pool.get_ref(), settings.get_ref());
    let response = executor.run(key_record, &ctx).await?;
    Ok(response.into_http_response())
}
