//! Thin adapters over the provider REST APIs.
//!
//! Adapters only shape requests and responses. Credentials come from the
//! [`TokenManager`]; breaking, retry and error classification come from the
//! [`OutboundClient`].

pub mod calcom;
pub mod calendly;
pub mod stripe;
pub mod zoom;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::error::IntegrationError;
use crate::oauth::TokenManager;
use crate::outbound::OutboundClient;
use crate::store::BookingStore;
use crate::types::Provider;

pub use calcom::CalcomClient;
pub use calendly::CalendlyClient;
pub use stripe::StripeClient;
pub use zoom::ZoomClient;

/// Authenticated JSON calls on behalf of a user, for OAuth providers.
#[derive(Clone)]
pub struct UserApi {
    provider: Provider,
    base_url: String,
    extra_headers: Vec<(&'static str, &'static str)>,
    outbound: OutboundClient,
    tokens: Arc<TokenManager>,
}

impl UserApi {
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        outbound: OutboundClient,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
            extra_headers: Vec::new(),
            outbound,
            tokens,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.extra_headers.push((name, value));
        self
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        user_id: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, IntegrationError> {
        self.call::<T, ()>(user_id, Method::GET, path, query, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        user_id: &str,
        path: &str,
        body: &B,
    ) -> Result<T, IntegrationError> {
        self.call(user_id, Method::POST, path, &[], Some(body)).await
    }

    async fn call<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        user_id: &str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, IntegrationError> {
        let token = self.tokens.access_token(user_id, self.provider).await?;
        let url = format!("{}{path}", self.base_url);

        let build = |http: &reqwest::Client| {
            let mut request = http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query);
            for (name, value) in &self.extra_headers {
                request = request.header(*name, *value);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            request
        };
        // Writes get one attempt; a lost response must not create twice.
        let result = if method == Method::GET {
            self.outbound.send_json(self.provider, build).await
        } else {
            self.outbound.send_json_once(self.provider, build).await
        };

        result.map_err(|err| {
            tracing::warn!(
                target: "provider",
                provider = %self.provider,
                user_id,
                path,
                error = %err,
                "Provider call failed"
            );
            err.into()
        })
    }
}

/// Adapters for every configured provider.
#[derive(Clone, Default)]
pub struct ProviderClients {
    pub calcom: Option<CalcomClient>,
    pub calendly: Option<CalendlyClient>,
    pub zoom: Option<ZoomClient>,
    pub stripe: Option<StripeClient>,
}

impl ProviderClients {
    pub fn new(
        config: &Config,
        outbound: &OutboundClient,
        tokens: &Arc<TokenManager>,
        bookings: Arc<dyn BookingStore>,
    ) -> Self {
        let user_api = |provider: Provider| {
            config
                .provider(provider)
                .filter(|cfg| cfg.oauth.is_some())
                .map(|cfg| UserApi::new(provider, &cfg.api_base_url, outbound.clone(), tokens.clone()))
        };

        Self {
            calcom: user_api(Provider::Calcom).map(CalcomClient::new),
            calendly: user_api(Provider::Calendly).map(CalendlyClient::new),
            zoom: user_api(Provider::Zoom).map(|api| ZoomClient::new(api, bookings)),
            stripe: config.provider(Provider::Stripe).and_then(|cfg| {
                cfg.api_key()
                    .map(|key| StripeClient::new(&cfg.api_base_url, key, outbound.clone()))
            }),
        }
    }
}
