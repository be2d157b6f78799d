//! OAuth token lifecycle: authorize, exchange, refresh, disconnect.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{Config, OAuthClientConfig};
use crate::error::{OAuthError, ProviderError, ProviderErrorKind};
use crate::outbound::OutboundClient;
use crate::store::CredentialStore;
use crate::types::{ConnectionStatus, IntegrationCredential, Provider};

/// Token endpoint response shared by the supported providers.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

pub struct TokenManager {
    clients: BTreeMap<Provider, OAuthClientConfig>,
    store: Arc<dyn CredentialStore>,
    outbound: OutboundClient,
    clock: Arc<dyn Clock>,
    refresh_margin: chrono::Duration,
}

impl TokenManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        outbound: OutboundClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let clients = config
            .providers
            .iter()
            .filter_map(|(p, cfg)| cfg.oauth.clone().map(|o| (*p, o)))
            .collect();
        Self::with_clients(clients, store, outbound, clock, config.refresh_margin)
    }

    pub fn with_clients(
        clients: BTreeMap<Provider, OAuthClientConfig>,
        store: Arc<dyn CredentialStore>,
        outbound: OutboundClient,
        clock: Arc<dyn Clock>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            clients,
            store,
            outbound,
            clock,
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or(chrono::Duration::minutes(5)),
        }
    }

    pub fn supports(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }

    fn client(&self, provider: Provider) -> Result<&OAuthClientConfig, OAuthError> {
        self.clients
            .get(&provider)
            .ok_or(OAuthError::NotConfigured(provider))
    }

    /// Provider authorize URL for the code flow.
    pub fn authorization_url(
        &self,
        provider: Provider,
        state: &str,
        pkce_challenge: Option<&str>,
    ) -> Result<String, OAuthError> {
        let client = self.client(provider)?;
        let scopes = client.scopes.join(" ");

        let mut params = vec![
            ("response_type", "code"),
            ("client_id", client.client_id.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("state", state),
        ];
        if !scopes.is_empty() {
            params.push(("scope", scopes.as_str()));
        }
        if let Some(challenge) = pkce_challenge {
            params.push(("code_challenge", challenge));
            params.push(("code_challenge_method", "S256"));
        }

        let url = Url::parse_with_params(&client.authorize_url, &params).map_err(|e| {
            tracing::error!(target: "oauth", provider = %provider, error = %e, "Invalid authorize URL");
            OAuthError::NotConfigured(provider)
        })?;
        Ok(url.into())
    }

    /// Trade an authorization code for tokens and store a CONNECTED credential.
    pub async fn exchange_code(
        &self,
        user_id: &str,
        provider: Provider,
        code: &str,
        redirect_uri: Option<&str>,
        pkce_verifier: Option<&str>,
    ) -> Result<IntegrationCredential, OAuthError> {
        let client = self.client(provider)?;
        let redirect_uri = redirect_uri.unwrap_or(&client.redirect_uri);

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret()),
        ];
        if let Some(verifier) = pkce_verifier {
            form.push(("code_verifier", verifier));
        }

        let tokens = self
            .token_request(provider, client, &form)
            .await
            .map_err(|source| OAuthError::TokenExchange { provider, source })?;

        let now = self.clock.now();
        let credential = IntegrationCredential {
            user_id: user_id.to_string(),
            provider,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: expiry(now, tokens.expires_in),
            scopes: scopes_of(tokens.scope.as_deref(), &client.scopes),
            status: ConnectionStatus::Connected,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let credential = self.store.upsert_credential(credential).await?;

        tracing::info!(
            target: "oauth",
            user_id,
            provider = %provider,
            expires_at = ?credential.expires_at,
            "Integration connected"
        );
        Ok(credential)
    }

    /// Whether the token expires within the refresh margin.
    pub fn needs_refresh(&self, credential: &IntegrationCredential) -> bool {
        match credential.expires_at {
            Some(expires_at) => expires_at - self.clock.now() <= self.refresh_margin,
            None => false,
        }
    }

    /// Refresh the access token.
    ///
    /// A rejected refresh token disconnects the integration. Other failures
    /// leave the credential in ERROR so the next successful refresh recovers
    /// it. A call short-circuited by the breaker leaves it untouched.
    pub async fn refresh(
        &self,
        credential: IntegrationCredential,
    ) -> Result<IntegrationCredential, OAuthError> {
        let provider = credential.provider;
        let client = self.client(provider)?;

        let Some(refresh_token) = credential.refresh_token.clone() else {
            tracing::warn!(
                target: "oauth",
                user_id = %credential.user_id,
                provider = %provider,
                "No refresh token available, integration must be reconnected"
            );
            self.mark_disconnected(credential, "no refresh token").await?;
            return Err(OAuthError::ReauthorizationRequired { provider });
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret()),
        ];

        match self.token_request(provider, client, &form).await {
            Ok(tokens) => {
                let now = self.clock.now();
                let mut updated = credential;
                updated.access_token = tokens.access_token;
                // Providers that do not rotate refresh tokens omit it.
                updated.refresh_token = tokens.refresh_token.or(Some(refresh_token));
                updated.expires_at = expiry(now, tokens.expires_in);
                if tokens.scope.is_some() {
                    updated.scopes = scopes_of(tokens.scope.as_deref(), &client.scopes);
                }
                updated.status = ConnectionStatus::Connected;
                updated.last_error = None;
                updated.updated_at = now;
                let updated = self.store.upsert_credential(updated).await?;
                tracing::debug!(
                    target: "oauth",
                    user_id = %updated.user_id,
                    provider = %provider,
                    "Access token refreshed"
                );
                Ok(updated)
            }
            Err(err) if is_rejected_grant(&err) => {
                tracing::warn!(
                    target: "oauth",
                    user_id = %credential.user_id,
                    provider = %provider,
                    error = %err,
                    "Refresh token rejected, disconnecting integration"
                );
                self.mark_disconnected(credential, &err.to_string()).await?;
                Err(OAuthError::ReauthorizationRequired { provider })
            }
            Err(err) if err.is_unavailable() => {
                tracing::debug!(
                    target: "oauth",
                    user_id = %credential.user_id,
                    provider = %provider,
                    "Token refresh skipped, provider circuit open"
                );
                Err(OAuthError::TokenRefresh {
                    provider,
                    source: err,
                })
            }
            Err(err) => {
                tracing::warn!(
                    target: "oauth",
                    user_id = %credential.user_id,
                    provider = %provider,
                    error = %err,
                    "Token refresh failed"
                );
                let mut failed = credential;
                failed.status = ConnectionStatus::Error;
                failed.last_error = Some(err.to_string());
                failed.updated_at = self.clock.now();
                self.store.upsert_credential(failed).await?;
                Err(OAuthError::TokenRefresh {
                    provider,
                    source: err,
                })
            }
        }
    }

    /// Current access token for the user, refreshed first when near expiry.
    pub async fn access_token(&self, user_id: &str, provider: Provider) -> Result<String, OAuthError> {
        let credential = self
            .store
            .get_credential(user_id, provider)
            .await?
            .filter(IntegrationCredential::is_connected)
            .ok_or(OAuthError::ReauthorizationRequired { provider })?;

        let credential = if self.needs_refresh(&credential) {
            self.refresh(credential).await?
        } else {
            credential
        };
        Ok(credential.access_token)
    }

    /// Mark the integration DISCONNECTED and drop its tokens.
    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<(), OAuthError> {
        if let Some(credential) = self.store.get_credential(user_id, provider).await? {
            self.mark_disconnected(credential, "disconnected by user").await?;
            tracing::info!(target: "oauth", user_id, provider = %provider, "Integration disconnected");
        }
        Ok(())
    }

    pub async fn is_connected(&self, user_id: &str, provider: Provider) -> Result<bool, OAuthError> {
        Ok(self
            .store
            .get_credential(user_id, provider)
            .await?
            .is_some_and(|c| c.is_connected()))
    }

    async fn mark_disconnected(
        &self,
        mut credential: IntegrationCredential,
        reason: &str,
    ) -> Result<(), OAuthError> {
        credential.status = ConnectionStatus::Disconnected;
        credential.access_token.clear();
        credential.refresh_token = None;
        credential.expires_at = None;
        credential.last_error = Some(reason.to_string());
        credential.updated_at = self.clock.now();
        self.store.upsert_credential(credential).await?;
        Ok(())
    }

    async fn token_request(
        &self,
        provider: Provider,
        client: &OAuthClientConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, ProviderError> {
        self.outbound
            .send_json(provider, |http| {
                let request = http.post(&client.token_url).form(form);
                if provider == Provider::Zoom {
                    // Zoom expects client credentials as HTTP Basic.
                    request.basic_auth(&client.client_id, Some(client.client_secret()))
                } else {
                    request
                }
            })
            .await
    }
}

/// Only an explicit credential rejection kills the grant. Other terminal
/// answers, such as `invalid_client`, leave the refresh token in place.
fn is_rejected_grant(err: &ProviderError) -> bool {
    err.kind == ProviderErrorKind::Http && err.auth_failure
}

fn expiry(now: DateTime<Utc>, expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|secs| now + chrono::Duration::seconds(secs))
}

fn scopes_of(granted: Option<&str>, requested: &[String]) -> Vec<String> {
    match granted {
        Some(scope) => scope
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => requested.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::clock::ManualClock;
    use crate::retry::{RetryConfig, RetryPolicy};
    use crate::store::JsonStore;

    fn manager(token_url: &str) -> (TokenManager, Arc<JsonStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(JsonStore::in_memory());
        let outbound = OutboundClient::new(
            Duration::from_secs(5),
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone()),
            RetryPolicy::new(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            }),
        )
        .unwrap();
        let mut clients = BTreeMap::new();
        clients.insert(
            Provider::Calendly,
            OAuthClientConfig::new(
                "client-id",
                "client-secret",
                "https://coach.example.com/oauth/calendly/callback",
                "https://auth.calendly.com/oauth/authorize",
                token_url,
                vec!["default".to_string()],
            ),
        );
        let manager = TokenManager::with_clients(
            clients,
            store.clone(),
            outbound,
            clock.clone(),
            Duration::from_secs(300),
        );
        (manager, store, clock)
    }

    fn credential(clock: &ManualClock, expires_in: chrono::Duration) -> IntegrationCredential {
        let now = clock.now();
        IntegrationCredential {
            user_id: "coach_1".into(),
            provider: Provider::Calendly,
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Some(now + expires_in),
            scopes: vec![],
            status: ConnectionStatus::Connected,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn refresh_needed_only_inside_margin() {
        let (manager, _, clock) = manager("http://127.0.0.1:1/token");
        assert!(manager.needs_refresh(&credential(&clock, chrono::Duration::minutes(2))));
        assert!(manager.needs_refresh(&credential(&clock, chrono::Duration::minutes(-1))));
        assert!(!manager.needs_refresh(&credential(&clock, chrono::Duration::hours(1))));

        let mut no_expiry = credential(&clock, chrono::Duration::zero());
        no_expiry.expires_at = None;
        assert!(!manager.needs_refresh(&no_expiry));
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let (manager, _, _) = manager("http://127.0.0.1:1/token");
        let url = manager
            .authorization_url(Provider::Calendly, "signed.state", Some("challenge123"))
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["state"], "signed.state");
        assert_eq!(params["code_challenge"], "challenge123");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(
            params["redirect_uri"],
            "https://coach.example.com/oauth/calendly/callback"
        );
    }

    #[test]
    fn unconfigured_provider_is_rejected() {
        let (manager, _, _) = manager("http://127.0.0.1:1/token");
        assert!(matches!(
            manager.authorization_url(Provider::Zoom, "s", None),
            Err(OAuthError::NotConfigured(Provider::Zoom))
        ));
    }

    #[tokio::test]
    async fn missing_refresh_token_disconnects() {
        let (manager, store, clock) = manager("http://127.0.0.1:1/token");
        let mut cred = credential(&clock, chrono::Duration::minutes(1));
        cred.refresh_token = None;
        store.upsert_credential(cred.clone()).await.unwrap();

        let err = manager.refresh(cred).await.unwrap_err();
        assert!(matches!(err, OAuthError::ReauthorizationRequired { .. }));
        let stored = store
            .get_credential("coach_1", Provider::Calendly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConnectionStatus::Disconnected);
        assert!(stored.access_token.is_empty());
    }

    #[tokio::test]
    async fn access_token_without_credential_requires_reauthorization() {
        let (manager, _, _) = manager("http://127.0.0.1:1/token");
        let err = manager
            .access_token("nobody", Provider::Calendly)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::ReauthorizationRequired { .. }));
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let (manager, store, clock) = manager("http://127.0.0.1:1/token");
        store
            .upsert_credential(credential(&clock, chrono::Duration::hours(1)))
            .await
            .unwrap();
        let token = manager
            .access_token("coach_1", Provider::Calendly)
            .await
            .unwrap();
        assert_eq!(token, "access");
    }

    #[test]
    fn scopes_fall_back_to_requested() {
        assert_eq!(scopes_of(Some("a b,c"), &[]), vec!["a", "b", "c"]);
        assert_eq!(scopes_of(None, &["x".to_string()]), vec!["x"]);
    }
}
