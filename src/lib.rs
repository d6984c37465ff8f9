pub mod configuration;
pub mod errors;
pub mod idempotency;
pub mod outbox;
pub mod payments;
pub mod rides;
pub mod routes;
pub mod startup;
pub mod telemetry;
pub mod users;
