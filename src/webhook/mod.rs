//! Inbound webhooks: verify, parse, dispatch.

pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod verification;

use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{Config, ProviderConfig};
use crate::error::IntegrationError;
use crate::types::Provider;

pub use dispatcher::{ProcessingResult, WebhookDispatcher, WebhookHandler};
pub use events::Delivery;

/// What the endpoint should answer for a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DeliveryOutcome {
    Event {
        event_id: String,
        event_type: String,
        status: ProcessingResult,
    },
    #[serde(rename_all = "camelCase")]
    ZoomValidation {
        plain_token: String,
        encrypted_token: String,
    },
}

pub struct WebhookReceiver {
    providers: BTreeMap<Provider, ProviderConfig>,
    dispatcher: WebhookDispatcher,
    clock: Arc<dyn Clock>,
}

impl WebhookReceiver {
    pub fn new(config: &Config, dispatcher: WebhookDispatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: config.providers.clone(),
            dispatcher,
            clock,
        }
    }

    /// Verify the signature over the raw body, then parse and dispatch.
    pub async fn receive(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<DeliveryOutcome, IntegrationError> {
        let secret = self
            .providers
            .get(&provider)
            .and_then(ProviderConfig::webhook_secret)
            .ok_or(IntegrationError::ProviderNotConfigured(provider))?;

        verification::verify_delivery(provider, headers, body, secret, self.clock.now())
            .inspect_err(|err| {
                tracing::warn!(
                    target: "webhook",
                    provider = %provider,
                    error = %err,
                    "Rejected webhook signature"
                );
            })?;

        match events::parse_delivery(provider, body)? {
            Delivery::ZoomUrlValidation { plain_token } => {
                let encrypted_token = verification::zoom_validation_token(&plain_token, secret);
                tracing::info!(target: "webhook", provider = %provider, "Answered URL validation");
                Ok(DeliveryOutcome::ZoomValidation {
                    plain_token,
                    encrypted_token,
                })
            }
            Delivery::Event(event) => {
                let event_id = event.id.clone();
                let event_type = event.event_type.clone();
                let status = self.dispatcher.dispatch(event).await?;
                Ok(DeliveryOutcome::Event {
                    event_id,
                    event_type,
                    status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::JsonStore;
    use axum::http::HeaderValue;
    use serde_json::json;

    const SECRET: &str = "zoom-webhook-secret-token";

    fn receiver() -> (WebhookReceiver, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = Config::from_lookup(|key| match key {
            "STATE_SIGNING_SECRET" => Some("0123456789abcdef0123".into()),
            "ZOOM_WEBHOOK_SECRET" => Some(SECRET.into()),
            _ => None,
        })
        .unwrap();
        let store = Arc::new(JsonStore::in_memory());
        let dispatcher = WebhookDispatcher::new(store, clock.clone());
        (WebhookReceiver::new(&config, dispatcher, clock.clone()), clock)
    }

    fn headers(provider: Provider, body: &[u8], clock: &ManualClock) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in verification::signed_headers(provider, body, SECRET, clock.now()) {
            map.insert(name, HeaderValue::from_str(&value).unwrap());
        }
        map
    }

    #[tokio::test]
    async fn zoom_url_validation_is_answered() {
        let (receiver, clock) = receiver();
        let body = serde_json::to_vec(&json!({
            "event": "endpoint.url_validation",
            "payload": {"plainToken": "plain-123"}
        }))
        .unwrap();

        let outcome = receiver
            .receive(Provider::Zoom, &headers(Provider::Zoom, &body, &clock), &body)
            .await
            .unwrap();
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["plainToken"], "plain-123");
        assert_eq!(
            value["encryptedToken"],
            verification::zoom_validation_token("plain-123", SECRET)
        );
    }

    #[tokio::test]
    async fn unconfigured_provider_is_not_found() {
        let (receiver, clock) = receiver();
        let body = b"{}";
        let err = receiver
            .receive(Provider::Stripe, &headers(Provider::Stripe, body, &clock), body)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::ProviderNotConfigured(Provider::Stripe)));
    }

    #[tokio::test]
    async fn signature_is_checked_before_parsing() {
        let (receiver, _) = receiver();
        let err = receiver
            .receive(Provider::Zoom, &HeaderMap::new(), b"not even json")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
