use actix_web::{HttpRequest, HttpResponse, web};
use sqlx::PgPool;

use crate::errors::RideError;
use crate::rides;
use crate::users;

#[tracing::instrument(name = "Fetch ride", skip(pool, request))]
pub async fn get_ride(
    ride_id: web::Path<i64>,
    pool: web::Data<PgPool>,
    request: HttpRequest,
) -> Result<HttpResponse, RideError> {
    let user = users::authenticate(pool.get_ref(), &request).await?;
    let ride = rides::find_ride(pool.get_ref(), ride_id.into_inner(), user.id)
        .await?
        .ok_or(RideError::NotFound)?;
    Ok(HttpResponse::Ok().json(ride))
}
