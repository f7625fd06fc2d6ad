use std::time::Duration;

use questforge_billing_core::{BillingError, PaymentProvider, ProviderSubscription};
use serde::Deserialize;
use tracing::debug;

use crate::{http_client, DEFAULT_HTTP_TIMEOUT};

pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl StripeConfig {
    #[must_use]
    pub fn new(secret_key: Option<String>, api_base: Option<String>) -> Self {
        Self {
            secret_key: secret_key.filter(|key| !key.trim().is_empty()),
            api_base: api_base
                .filter(|base| !base.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string()),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

impl StripeClient {
    #[must_use]
    pub fn new(config: StripeConfig) -> Self {
        Self { config }
    }

    fn subscription_url(&self, subscription_id: &str) -> String {
        format!(
            "{}/v1/subscriptions/{subscription_id}",
            self.config.api_base.trim_end_matches('/')
        )
    }
}

impl PaymentProvider for StripeClient {
    fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, BillingError> {
        let secret_key = self.config.secret_key.as_deref().ok_or_else(|| {
            BillingError::Configuration("Stripe secret key not configured".to_string())
        })?;
        if subscription_id.is_empty()
            || !subscription_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(BillingError::Provider(format!(
                "invalid subscription id: {subscription_id:?}"
            )));
        }

        let client = http_client(self.config.timeout).map_err(BillingError::Provider)?;
        debug!(subscription_id, "retrieving subscription from provider");

        let response = client
            .get(self.subscription_url(subscription_id))
            .bearer_auth(secret_key)
            .send()
            .map_err(|err| BillingError::Provider(format!("subscription request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error.message)
                .unwrap_or_else(|| format!("provider returned {status}"));
            return Err(BillingError::Provider(message));
        }

        response
            .json::<ProviderSubscription>()
            .map_err(|err| BillingError::Provider(format!("invalid subscription response: {err}")))
    }
}
