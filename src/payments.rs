use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::configuration::PaymentSettings;

/// One charge forwarded to the payment processor.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest<'a> {
    pub amount_cents: i64,
    pub currency: &'a str,
    pub customer_email: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeReceipt {
    pub charge_id: String,
}

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Success(ChargeReceipt),
    /// Permanent refusal; retrying the same charge will not help.
    Declined { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Transport failure or processor 5xx; safe to retry with the same
    /// token, the processor deduplicates on it.
    #[error("transient payment processor failure: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Narrow seam to the payment processor. `token` must be stable across
/// retries of the same request so the processor charges at most once.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        token: &str,
        request: &ChargeRequest<'_>,
    ) -> Result<ChargeOutcome, PaymentError>;
}

/// Production gateway speaking JSON over HTTP to the processor.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(settings: &PaymentSettings) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeclineBody {
    error: Option<String>,
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(name = "Charge card", skip(self, request), fields(token = token))]
    async fn charge(
        &self,
        token: &str,
        request: &ChargeRequest<'_>,
    ) -> Result<ChargeOutcome, PaymentError> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .header("Idempotency-Key", token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                PaymentError::Transient(
                    anyhow::Error::new(e).context("charge request never reached the processor"),
                )
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::Transient(anyhow::anyhow!(
                "payment processor returned {status}"
            )));
        }
        if status.is_success() {
            let receipt = response.json::<ChargeReceipt>().await.map_err(|e| {
                PaymentError::Transient(
                    anyhow::Error::new(e).context("unreadable charge receipt"),
                )
            })?;
            return Ok(ChargeOutcome::Success(receipt));
        }

        let decline = response.json::<DeclineBody>().await.unwrap_or_default();
        let reason = decline
            .error
            .unwrap_or_else(|| format!("processor rejected the charge ({status})"));
        Ok(ChargeOutcome::Declined { reason })
    }
}
