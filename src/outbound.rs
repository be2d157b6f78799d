//! Outbound HTTP to provider APIs.
//!
//! Every call goes through the provider's circuit breaker and the retry
//! policy, and every failure is classified into a [`ProviderError`] here, at
//! the boundary where the response is seen.

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::ProviderError;
use crate::retry::RetryPolicy;
use crate::types::Provider;

#[derive(Clone)]
pub struct OutboundClient {
    http: Client,
    breakers: CircuitBreakerRegistry,
    retry: RetryPolicy,
}

impl OutboundClient {
    pub fn new(
        timeout: Duration,
        breakers: CircuitBreakerRegistry,
        retry: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coach-integrations/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            breakers,
            retry,
        })
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Send the request built by `build`, retrying transient failures, and
    /// decode the JSON response body.
    ///
    /// `build` runs once per attempt so each attempt gets a fresh request.
    pub async fn send_json<T, B>(&self, provider: Provider, build: B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        self.send_with(&self.retry, provider, build).await
    }

    /// Like [`send_json`](Self::send_json) but with a single attempt, for
    /// requests that create something on the provider side.
    pub async fn send_json_once<T, B>(&self, provider: Provider, build: B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        self.send_with(&self.retry.single_attempt(), provider, build)
            .await
    }

    async fn send_with<T, B>(
        &self,
        policy: &RetryPolicy,
        provider: Provider,
        build: B,
    ) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        let breaker = self.breakers.get(provider);
        policy
            .run(&breaker, |attempt| {
                let request = build(&self.http);
                async move {
                    tracing::debug!(target: "outbound", provider = %provider, attempt, "Calling provider");
                    let response = request
                        .send()
                        .await
                        .map_err(|e| ProviderError::network(provider, &e))?;
                    read_json(provider, response).await
                }
            })
            .await
    }
}

async fn read_json<T: DeserializeOwned>(provider: Provider, response: Response) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ProviderError::network(provider, &e))?;

    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        return Err(ProviderError::from_response(provider, status.as_u16(), &text));
    }

    // 204 and other empty bodies decode as JSON null.
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &body
    };
    serde_json::from_slice(body).map_err(|e| ProviderError::decode(provider, e.to_string()))
}
