use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. \
                Use either `local` or `production`."
            )),
        }
    }
}

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    pub payment: PaymentSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: SecretString,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    #[must_use]
    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
            .database(&self.database_name)
    }
}

/// Knobs of the idempotent request machinery.
#[derive(serde::Deserialize, Clone)]
pub struct IdempotencySettings {
    /// Seconds after which a held lock counts as abandoned and may be
    /// stolen by another request.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u32,
    /// Attempts per phase when failures look transient.
    #[serde(default = "default_phase_max_attempts")]
    pub phase_max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_phase_backoff_base_ms")]
    pub phase_backoff_base_ms: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl_seconds(),
            phase_max_attempts: default_phase_max_attempts(),
            phase_backoff_base_ms: default_phase_backoff_base_ms(),
        }
    }
}

const fn default_lease_ttl_seconds() -> u32 {
    90
}

const fn default_phase_max_attempts() -> u32 {
    2
}

const fn default_phase_backoff_base_ms() -> u64 {
    50
}

impl IdempotencySettings {
    #[must_use]
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.lease_ttl_seconds))
    }

    /// A phase attempt must finish well inside the lease TTL, so a stalled
    /// executor cannot outlive its own lease.
    #[must_use]
    pub fn phase_deadline(&self) -> Duration {
        Duration::from_secs(u64::from((self.lease_ttl_seconds / 3).max(1)))
    }

    /// Delay before retry number `attempt + 1`; doubles per attempt.
    #[must_use]
    pub fn phase_backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.phase_backoff_base_ms.saturating_mul(1 << doublings))
    }
}

#[derive(serde::Deserialize, Clone)]
pub struct PaymentSettings {
    pub base_url: String,
    #[serde(default = "default_payment_timeout_ms")]
    pub request_timeout_ms: u64,
}

const fn default_payment_timeout_ms() -> u64 {
    5_000
}

impl PaymentSettings {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
