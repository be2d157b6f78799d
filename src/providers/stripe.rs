use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::IntegrationError;
use crate::outbound::OutboundClient;
use crate::types::Provider;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn booking_reference(&self) -> Option<&str> {
        self.metadata
            .get("booking_reference")
            .or_else(|| self.metadata.get("booking_id"))
            .map(String::as_str)
            .or(self.client_reference_id.as_deref())
    }
}

/// Stripe calls authenticated with the platform secret key.
#[derive(Clone)]
pub struct StripeClient {
    base_url: String,
    api_key: SecretString,
    outbound: OutboundClient,
}

impl StripeClient {
    pub fn new(base_url: impl Into<String>, api_key: &str, outbound: OutboundClient) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.to_string()),
            outbound,
        }
    }

    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, IntegrationError> {
        let url = format!("{}/checkout/sessions/{session_id}", self.base_url);
        let session = self
            .outbound
            .send_json(Provider::Stripe, |http| {
                http.get(&url).bearer_auth(self.api_key.expose_secret())
            })
            .await?;
        Ok(session)
    }
}
