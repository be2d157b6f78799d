//! Signed, expiring OAuth `state` tokens and PKCE helpers.
//!
//! A state token is `base64url(json claims) "." base64url(hmac_sha256)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::error::OAuthError;
use crate::types::Provider;

type HmacSha256 = Hmac<Sha256>;

/// PKCE code verifier length in bytes (before base64 encoding).
const PKCE_VERIFIER_LENGTH: usize = 32;

/// Claims carried through the provider's authorize redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthState {
    pub user_id: String,
    pub provider: Provider,
    /// Where to send the browser once the callback completes.
    pub redirect_to: Option<String>,
    pub pkce_verifier: Option<String>,
    pub nonce: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// PKCE challenge and verifier pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Kept secret, travels inside the signed state.
    pub verifier: String,
    /// S256 challenge sent to the provider.
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; PKCE_VERIFIER_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Clone)]
pub struct StateSigner {
    key: Vec<u8>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl StateSigner {
    pub fn new(secret: &str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl,
            clock,
        }
    }

    /// Build claims for a new authorization attempt, expiring after the TTL.
    pub fn claims(
        &self,
        user_id: &str,
        provider: Provider,
        redirect_to: Option<String>,
        pkce_verifier: Option<String>,
    ) -> OAuthState {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(10));
        OAuthState {
            user_id: user_id.to_string(),
            provider,
            redirect_to,
            pkce_verifier,
            nonce: uuid::Uuid::new_v4().to_string(),
            exp: (self.clock.now() + ttl).timestamp(),
        }
    }

    pub fn issue(&self, state: &OAuthState) -> Result<String, OAuthError> {
        let json = serde_json::to_vec(state)
            .map_err(|e| OAuthError::InvalidState(format!("encode: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes()));
        Ok(format!("{payload}.{signature}"))
    }

    /// Check signature, expiry and that the token was issued for `provider`.
    pub fn verify(&self, token: &str, provider: Provider) -> Result<OAuthState, OAuthError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| OAuthError::InvalidState("malformed token".to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| OAuthError::InvalidState("malformed signature".to_string()))?;
        let expected = self.mac(payload.as_bytes());
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return Err(OAuthError::InvalidState("signature mismatch".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| OAuthError::InvalidState("malformed payload".to_string()))?;
        let state: OAuthState = serde_json::from_slice(&json)
            .map_err(|e| OAuthError::InvalidState(format!("decode: {e}")))?;

        if state.exp <= self.clock.now().timestamp() {
            return Err(OAuthError::InvalidState("state has expired".to_string()));
        }
        if state.provider != provider {
            return Err(OAuthError::InvalidState(format!(
                "state issued for {}, not {provider}",
                state.provider
            )));
        }
        Ok(state)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(m) => m,
            Err(_) => unreachable!("hmac accepts any key length"),
        };
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
