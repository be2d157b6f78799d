use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{IntegrationError, OAuthError, Result};
use crate::oauth::{PkceChallenge, StateSigner, TokenManager};
use crate::outbound::OutboundClient;
use crate::providers::{zoom::MeetingRequest, ProviderClients};
use crate::retry::RetryPolicy;
use crate::store::{BookingStore, CredentialStore, JsonStore};
use crate::types::{ConnectionStatus, IntegrationCredential, Provider};
use crate::webhook::{handlers, DeliveryOutcome, WebhookDispatcher, WebhookReceiver};

/// Header the identity layer sets on authenticated requests.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookReceiver>,
    pub tokens: Arc<TokenManager>,
    pub state_signer: StateSigner,
    pub credentials: Arc<dyn CredentialStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub breakers: CircuitBreakerRegistry,
    pub providers: ProviderClients,
}

impl AppState {
    /// Wire stores, breakers, the token manager and the webhook pipeline.
    pub async fn build(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let store = Arc::new(match &config.data_dir {
            Some(dir) => JsonStore::open(dir).await?,
            None => {
                tracing::warn!("DATA_DIR not set, integration state is kept in memory only");
                JsonStore::in_memory()
            }
        });
        Self::with_store(config, clock, store)
    }

    pub fn with_store(
        config: &Config,
        clock: Arc<dyn Clock>,
        store: Arc<JsonStore>,
    ) -> anyhow::Result<Self> {
        let breakers = CircuitBreakerRegistry::new(config.circuit.clone(), clock.clone());
        let outbound = OutboundClient::new(
            config.http_timeout,
            breakers.clone(),
            RetryPolicy::new(config.retry.clone()),
        )?;

        let tokens = Arc::new(TokenManager::new(
            config,
            store.clone(),
            outbound.clone(),
            clock.clone(),
        ));

        let mut dispatcher = WebhookDispatcher::new(store.clone(), clock.clone());
        handlers::register_booking_handlers(&mut dispatcher, store.clone());
        let webhooks = Arc::new(WebhookReceiver::new(config, dispatcher, clock.clone()));

        let providers = ProviderClients::new(config, &outbound, &tokens, store.clone());

        Ok(Self {
            webhooks,
            tokens,
            state_signer: StateSigner::new(config.state_secret(), config.state_ttl, clock),
            credentials: store.clone(),
            bookings: store,
            breakers,
            providers,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(handle_webhook))
        .route("/oauth/{provider}/authorize", get(authorize))
        .route("/oauth/{provider}/callback", get(oauth_callback))
        .route("/oauth/{provider}/token-exchange", post(token_exchange))
        .route("/oauth/{provider}/disconnect", post(disconnect))
        .route("/integrations", get(list_integrations))
        .route("/bookings/{reference}/meeting", post(create_meeting))
        .route("/admin/circuits", get(circuits))
        .with_state(state)
}

/// Bind `config.addr` and serve until the process is stopped.
pub async fn serve(config: &Config, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "integration gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ─── Extractors ─────────────────────────────────────────────────────────────

/// User id asserted by the identity layer in front of this service.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = IntegrationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| AuthenticatedUser(v.to_string()))
            .ok_or(IntegrationError::Unauthenticated)
    }
}

fn parse_provider(raw: &str) -> Result<Provider> {
    raw.parse()
        .map_err(|_| IntegrationError::UnknownProvider(raw.to_string()))
}

fn oauth_provider(state: &AppState, raw: &str) -> Result<Provider> {
    let provider = parse_provider(raw)?;
    if !provider.uses_oauth() || !state.tokens.supports(provider) {
        return Err(OAuthError::NotConfigured(provider).into());
    }
    Ok(provider)
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

// ─── Health & status ────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn circuits(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "circuits": state.breakers.statuses() }))
}

// ─── Webhooks ───────────────────────────────────────────────────────────────

async fn handle_webhook(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let provider = parse_provider(&provider)?;
    let outcome = state.webhooks.receive(provider, &headers, &body).await?;

    let response = match outcome {
        // Zoom expects exactly `{plainToken, encryptedToken}`.
        validation @ DeliveryOutcome::ZoomValidation { .. } => Json(validation).into_response(),
        DeliveryOutcome::Event {
            event_id,
            event_type,
            status,
        } => Json(json!({
            "success": true,
            "status": status,
            "event_id": event_id,
            "event_type": event_type,
        }))
        .into_response(),
    };
    Ok(response)
}

// ─── OAuth ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    redirect_to: Option<String>,
}

async fn authorize(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response> {
    let provider = oauth_provider(&state, &provider)?;
    if let Some(target) = query.redirect_to.as_deref() {
        // Relative paths only.
        if !target.starts_with('/') || target.starts_with("//") {
            return Err(OAuthError::InvalidState("redirect_to must be a relative path".to_string()).into());
        }
    }
    let pkce = PkceChallenge::generate();
    let claims = state
        .state_signer
        .claims(&user_id, provider, query.redirect_to, Some(pkce.verifier));
    let signed = state.state_signer.issue(&claims)?;
    let url = state
        .tokens
        .authorization_url(provider, &signed, Some(&pkce.challenge))?;

    tracing::info!(user_id = %user_id, provider = %provider, "Starting OAuth authorization");
    Ok(found(&url))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let provider = oauth_provider(&state, &provider)?;
    if let Some(error) = query.error {
        return Err(OAuthError::InvalidState(format!("authorization denied: {error}")).into());
    }
    let signed = query
        .state
        .ok_or_else(|| OAuthError::InvalidState("missing state".to_string()))?;
    let code = query
        .code
        .ok_or_else(|| OAuthError::InvalidState("missing code".to_string()))?;

    let claims = state.state_signer.verify(&signed, provider)?;
    let credential = state
        .tokens
        .exchange_code(
            &claims.user_id,
            provider,
            &code,
            None,
            claims.pkce_verifier.as_deref(),
        )
        .await?;

    Ok(match claims.redirect_to {
        Some(target) => found(&target),
        None => Json(connection_summary(&credential)).into_response(),
    })
}

#[derive(Debug, Deserialize)]
struct TokenExchangeRequest {
    code: String,
    redirect_uri: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConnectionSummary {
    success: bool,
    provider: Provider,
    status: ConnectionStatus,
    expires_at: Option<DateTime<Utc>>,
    scopes: Vec<String>,
}

/// Never includes tokens.
fn connection_summary(credential: &IntegrationCredential) -> ConnectionSummary {
    ConnectionSummary {
        success: true,
        provider: credential.provider,
        status: credential.status,
        expires_at: credential.expires_at,
        scopes: credential.scopes.clone(),
    }
}

async fn token_exchange(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<TokenExchangeRequest>,
) -> Result<Json<ConnectionSummary>> {
    let provider = oauth_provider(&state, &provider)?;

    let pkce_verifier = match request.state.as_deref() {
        Some(signed) => {
            let claims = state.state_signer.verify(signed, provider)?;
            if claims.user_id != user_id {
                return Err(OAuthError::InvalidState("state issued to another user".to_string()).into());
            }
            claims.pkce_verifier
        }
        None => None,
    };

    let credential = state
        .tokens
        .exchange_code(
            &user_id,
            provider,
            &request.code,
            request.redirect_uri.as_deref(),
            pkce_verifier.as_deref(),
        )
        .await?;
    Ok(Json(connection_summary(&credential)))
}

async fn disconnect(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<serde_json::Value>> {
    let provider = oauth_provider(&state, &provider)?;
    state.tokens.disconnect(&user_id, provider).await?;
    Ok(Json(json!({
        "success": true,
        "provider": provider,
        "status": ConnectionStatus::Disconnected,
    })))
}

#[derive(Debug, Serialize)]
struct IntegrationStatus {
    provider: Provider,
    connected: bool,
    status: Option<ConnectionStatus>,
    reconnect_required: bool,
    expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

async fn list_integrations(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<serde_json::Value>> {
    let credentials = state.credentials.list_credentials(&user_id).await?;

    let integrations: Vec<IntegrationStatus> = Provider::ALL
        .into_iter()
        .filter(|p| p.uses_oauth() && state.tokens.supports(*p))
        .map(|provider| {
            let credential = credentials.iter().find(|c| c.provider == provider);
            let status = credential.map(|c| c.status);
            IntegrationStatus {
                provider,
                connected: credential.is_some_and(IntegrationCredential::is_connected),
                status,
                reconnect_required: status == Some(ConnectionStatus::Disconnected),
                expires_at: credential.and_then(|c| c.expires_at),
                last_error: credential.and_then(|c| c.last_error.clone()),
            }
        })
        .collect();

    Ok(Json(json!({ "success": true, "integrations": integrations })))
}

// ─── Bookings ───────────────────────────────────────────────────────────────

async fn create_meeting(
    Path(reference): Path<String>,
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<MeetingRequest>,
) -> Result<Json<serde_json::Value>> {
    let zoom = state
        .providers
        .zoom
        .as_ref()
        .ok_or(IntegrationError::ProviderNotConfigured(Provider::Zoom))?;
    let booking = state
        .bookings
        .get_booking(&reference)
        .await?
        .ok_or_else(|| IntegrationError::BookingNotFound(reference.clone()))?;

    let (meeting, booking) = zoom
        .create_meeting_for_booking(&user_id, &booking, &request)
        .await?;
    Ok(Json(json!({
        "success": true,
        "meeting": meeting,
        "booking": booking,
    })))
}
