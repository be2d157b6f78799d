//! Error types for the integration layer.
//!
//! Retryability is decided once, where the HTTP response or transport failure
//! is observed, and carried as a field on [`ProviderError`]. Nothing
//! downstream re-inspects error strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::Provider;

/// Provider response bodies are kept for diagnostics, but bounded.
const MAX_ERROR_BODY: usize = 512;

/// Markers in a provider error body that mean the credential itself is bad.
const AUTH_FAILURE_MARKERS: [&str; 3] = ["invalid_grant", "invalid_token", "unauthorized"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Connection refused, DNS, TLS, reset.
    Network,
    /// The attempt exceeded its timeout.
    Timeout,
    /// Provider answered with a non-2xx status.
    Http,
    /// Response could not be decoded.
    Decode,
    /// Circuit breaker is open; no call was made.
    Unavailable,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Network => "network error",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Http => "http error",
            ProviderErrorKind::Decode => "decode error",
            ProviderErrorKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Failure of a single outbound provider call.
#[derive(Debug, Clone, Error)]
#[error("{provider} {kind}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ProviderError {
    pub provider: Provider,
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retryable: bool,
    /// The provider rejected the credential itself (`invalid_grant` and kin).
    pub auth_failure: bool,
}

impl ProviderError {
    /// Classify a non-2xx provider response.
    ///
    /// Token/auth failures (`invalid_grant`, `invalid_token`, `unauthorized`)
    /// and other 4xx responses are terminal; 408, 429 and 5xx are retryable.
    pub fn from_response(provider: Provider, status: u16, body: &str) -> Self {
        let lowered = body.to_ascii_lowercase();
        let auth_failure = AUTH_FAILURE_MARKERS.iter().any(|m| lowered.contains(m));
        let retryable = !auth_failure && matches!(status, 408 | 429 | 500..=599);

        Self {
            provider,
            kind: ProviderErrorKind::Http,
            status: Some(status),
            message: truncate(body),
            retryable,
            auth_failure,
        }
    }

    pub fn network(provider: Provider, err: &reqwest::Error) -> Self {
        // reqwest reports its own client timeout as an error, not as elapsed.
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            provider,
            kind,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            retryable: true,
            auth_failure: false,
        }
    }

    pub fn timeout(provider: Provider, after: Duration) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Timeout,
            status: None,
            message: format!("no response after {}ms", after.as_millis()),
            retryable: true,
            auth_failure: false,
        }
    }

    pub fn decode(provider: Provider, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Decode,
            status: None,
            message: truncate(&message.into()),
            retryable: false,
            auth_failure: false,
        }
    }

    pub fn unavailable(provider: Provider) -> Self {
        Self {
            provider,
            kind: ProviderErrorKind::Unavailable,
            status: None,
            message: "circuit breaker open".to_string(),
            retryable: false,
            auth_failure: false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == ProviderErrorKind::Unavailable
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Webhook signature failures. Always surfaced as 401.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature header malformed: {0}")]
    Malformed(String),

    #[error("signature does not match payload")]
    Mismatch,

    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
}

/// Persistence failures from the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures of the OAuth token lifecycle.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("token exchange with {provider} failed: {source}")]
    TokenExchange {
        provider: Provider,
        #[source]
        source: ProviderError,
    },

    #[error("token refresh with {provider} failed: {source}")]
    TokenRefresh {
        provider: Provider,
        #[source]
        source: ProviderError,
    },

    #[error("{provider} integration must be reconnected")]
    ReauthorizationRequired { provider: Provider },

    #[error("invalid OAuth state: {0}")]
    InvalidState(String),

    #[error("{0} is not configured for OAuth")]
    NotConfigured(Provider),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl OAuthError {
    /// Whether the caller may try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            OAuthError::TokenExchange { source, .. } | OAuthError::TokenRefresh { source, .. } => {
                source.retryable || source.is_unavailable()
            }
            _ => false,
        }
    }
}

/// Failure raised by a registered webhook handler.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError(err.to_string())
    }
}

/// Top-level error for the HTTP surface.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("handler for {event_type} failed: {message}")]
    Handler { event_type: String, message: String },

    #[error("event {0} is already being processed")]
    EventInProgress(String),

    #[error("{0} is temporarily unavailable")]
    ProviderUnavailable(Provider),

    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    OAuth(OAuthError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{0} is not configured")]
    ProviderNotConfigured(Provider),

    #[error("authentication required")]
    Unauthenticated,

    #[error("booking {0} not found")]
    BookingNotFound(String),
}

impl From<ProviderError> for IntegrationError {
    fn from(err: ProviderError) -> Self {
        if err.is_unavailable() {
            IntegrationError::ProviderUnavailable(err.provider)
        } else {
            IntegrationError::Provider(err)
        }
    }
}

impl From<OAuthError> for IntegrationError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::TokenExchange { source, .. } | OAuthError::TokenRefresh { source, .. }
                if source.is_unavailable() =>
            {
                IntegrationError::ProviderUnavailable(source.provider)
            }
            err => IntegrationError::OAuth(err),
        }
    }
}

impl IntegrationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IntegrationError::Signature(_) => StatusCode::UNAUTHORIZED,
            IntegrationError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            IntegrationError::Handler { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IntegrationError::EventInProgress(_) => StatusCode::CONFLICT,
            IntegrationError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IntegrationError::Provider(_) => StatusCode::BAD_GATEWAY,
            IntegrationError::OAuth(err) => match err {
                OAuthError::ReauthorizationRequired { .. } => StatusCode::CONFLICT,
                OAuthError::InvalidState(_) => StatusCode::BAD_REQUEST,
                OAuthError::NotConfigured(_) => StatusCode::NOT_FOUND,
                OAuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                OAuthError::TokenExchange { .. } | OAuthError::TokenRefresh { .. } => {
                    if err.is_retryable() {
                        StatusCode::BAD_GATEWAY
                    } else {
                        StatusCode::BAD_REQUEST
                    }
                }
            },
            IntegrationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IntegrationError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            IntegrationError::ProviderNotConfigured(_) => StatusCode::NOT_FOUND,
            IntegrationError::Unauthenticated => StatusCode::UNAUTHORIZED,
            IntegrationError::BookingNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            IntegrationError::Signature(_) => "invalid_signature",
            IntegrationError::MalformedPayload(_) => "malformed_payload",
            IntegrationError::Handler { .. } => "handler_failed",
            IntegrationError::EventInProgress(_) => "event_in_progress",
            IntegrationError::ProviderUnavailable(_) => "provider_unavailable",
            IntegrationError::Provider(_) => "provider_error",
            IntegrationError::OAuth(OAuthError::ReauthorizationRequired { .. }) => {
                "reconnect_required"
            }
            IntegrationError::OAuth(OAuthError::InvalidState(_)) => "invalid_state",
            IntegrationError::OAuth(_) => "oauth_error",
            IntegrationError::Storage(_) => "storage_error",
            IntegrationError::UnknownProvider(_) => "unknown_provider",
            IntegrationError::ProviderNotConfigured(_) => "provider_not_configured",
            IntegrationError::Unauthenticated => "unauthenticated",
            IntegrationError::BookingNotFound(_) => "booking_not_found",
        }
    }
}

impl IntoResponse for IntegrationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        } else {
            tracing::warn!(error = %self, code = self.error_code(), "request rejected");
        }

        let body = serde_json::json!({
            "success": false,
            "error": self.error_code(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_body_is_terminal() {
        let err = ProviderError::from_response(
            Provider::Calendly,
            500,
            r#"{"error":"invalid_grant","error_description":"expired"}"#,
        );
        assert!(!err.retryable);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        for status in [408, 429, 500, 502, 503] {
            let err = ProviderError::from_response(Provider::Zoom, status, "try later");
            assert!(err.retryable, "HTTP {status} should be retryable");
        }
    }

    #[test]
    fn only_credential_rejections_are_auth_failures() {
        let grant = ProviderError::from_response(Provider::Zoom, 400, r#"{"error":"invalid_grant"}"#);
        assert!(grant.auth_failure);
        let client = ProviderError::from_response(Provider::Zoom, 401, r#"{"error":"invalid_client"}"#);
        assert!(!client.auth_failure);
        assert!(!client.retryable);
        assert!(!ProviderError::timeout(Provider::Zoom, Duration::from_secs(1)).auth_failure);
    }

    #[test]
    fn client_errors_are_terminal() {
        let err = ProviderError::from_response(Provider::Calcom, 404, "not found");
        assert!(!err.retryable);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let err = ProviderError::from_response(Provider::Stripe, 500, &body);
        assert!(err.message.len() < 600);
    }

    #[test]
    fn breaker_short_circuit_maps_to_503() {
        let err: IntegrationError = ProviderError::unavailable(Provider::Zoom).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn short_circuited_refresh_is_unavailable() {
        let err: IntegrationError = OAuthError::TokenRefresh {
            provider: Provider::Calcom,
            source: ProviderError::unavailable(Provider::Calcom),
        }
        .into();
        assert_eq!(err.error_code(), "provider_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn reauthorization_maps_to_reconnect_required() {
        let err = IntegrationError::OAuth(OAuthError::ReauthorizationRequired {
            provider: Provider::Calcom,
        });
        assert_eq!(err.error_code(), "reconnect_required");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
