use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

/// Flat fare per ride, in cents.
pub const RIDE_FARE_CENTS: i64 = 20_00;

const RIDE_COLUMNS: &str =
    "id, created_at, user_id, origin_lat, origin_lon, target_lat, target_lon, charge_id";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Ride {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
    pub charge_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RideParams {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
}

impl RideParams {
    /// Coordinates outside WGS84 bounds never describe a ride.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value, bound) in [
            ("origin_lat", self.origin_lat, 90.0),
            ("origin_lon", self.origin_lon, 180.0),
            ("target_lat", self.target_lat, 90.0),
            ("target_lon", self.target_lon, 180.0),
        ] {
            if !value.is_finite() || value.abs() > bound {
                return Err(format!("{name} must be a finite value within ±{bound}"));
            }
        }
        Ok(())
    }
}

pub async fn find_by_key_id(
    tx: &mut Transaction<'_, Postgres>,
    key_id: i64,
) -> Result<Option<Ride>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE idempotency_key_id = $1"
    ))
    .bind(key_id)
    .fetch_optional(&mut **tx)
    .await
}

pub async fn insert_ride(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    key_id: i64,
    params: &RideParams,
) -> Result<Ride, sqlx::Error> {
    sqlx::query_as(&format!(
        "INSERT INTO rides \
             (user_id, idempotency_key_id, origin_lat, origin_lon, target_lat, target_lon, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now()) \
         RETURNING {RIDE_COLUMNS}"
    ))
    .bind(user_id)
    .bind(key_id)
    .bind(params.origin_lat)
    .bind(params.origin_lon)
    .bind(params.target_lat)
    .bind(params.target_lon)
    .fetch_one(&mut **tx)
    .await
}

pub async fn record_charge(
    tx: &mut Transaction<'_, Postgres>,
    ride_id: i64,
    charge_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE rides SET charge_id = $2 WHERE id = $1")
        .bind(ride_id)
        .bind(charge_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Observational read for the GET endpoint; read-committed is enough.
pub async fn find_ride(
    pool: &PgPool,
    ride_id: i64,
    user_id: i64,
) -> Result<Option<Ride>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1 AND user_id = $2"
    ))
    .bind(ride_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

/// Facts recorded alongside a domain write, in the same transaction.
#[derive(Debug)]
pub struct AuditRecord<'a> {
    pub action: &'a str,
    pub data: &'a serde_json::Value,
    pub origin_ip: Option<&'a str>,
    pub resource_type: &'a str,
    pub resource_id: i64,
    pub user_id: i64,
}

pub async fn insert_audit_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &AuditRecord<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_records \
             (action, data, origin_ip, resource_type, resource_id, user_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(record.action)
    .bind(record.data)
    .bind(record.origin_ip)
    .bind(record.resource_type)
    .bind(record.resource_id)
    .bind(record.user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
