//! Configuration loaded from environment variables.

use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::types::Provider;

/// OAuth client registration for one provider.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    client_secret: SecretString,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            redirect_uri: redirect_uri.into(),
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            scopes,
        }
    }

    /// Get the client secret (exposes the secret).
    pub(crate) fn client_secret(&self) -> &str {
        self.client_secret.expose_secret()
    }
}

/// Everything needed to talk to one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub api_base_url: String,
    pub oauth: Option<OAuthClientConfig>,
    webhook_secret: Option<SecretString>,
    api_key: Option<SecretString>,
}

impl ProviderConfig {
    pub fn new(provider: Provider, api_base_url: impl Into<String>) -> Self {
        Self {
            provider,
            api_base_url: api_base_url.into(),
            oauth: None,
            webhook_secret: None,
            api_key: None,
        }
    }

    pub fn with_oauth(mut self, oauth: OAuthClientConfig) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Get the webhook signing secret (exposes the secret).
    pub(crate) fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_ref().map(|s| s.expose_secret())
    }

    /// Get the platform API key (exposes the secret).
    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|s| s.expose_secret())
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address.
    pub addr: SocketAddr,
    /// Directory for the JSON store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Externally reachable base URL, used to derive default redirect URIs.
    pub public_base_url: String,
    state_secret: SecretString,
    pub state_ttl: Duration,
    pub http_timeout: Duration,
    pub refresh_margin: Duration,
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub providers: BTreeMap<Provider, ProviderConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `BIND_ADDR` | Server bind address | `127.0.0.1:8790` |
    /// | `DATA_DIR` | JSON store directory | (in-memory) |
    /// | `PUBLIC_BASE_URL` | Public base URL | `http://127.0.0.1:8790` |
    /// | `STATE_SIGNING_SECRET` | OAuth state HMAC key | (required) |
    /// | `HTTP_TIMEOUT_SECS` | Outbound call timeout | `15` |
    /// | `CIRCUIT_FAILURE_THRESHOLD` | Failures before opening | `5` |
    /// | `CIRCUIT_RESET_TIMEOUT_MS` | Open duration | `60000` |
    /// | `RETRY_MAX_RETRIES` | Attempts before giving up | `3` |
    /// | `RETRY_BASE_DELAY_MS` | First backoff step | `500` |
    /// | `RETRY_MAX_DELAY_MS` | Backoff cap | `10000` |
    /// | `TOKEN_REFRESH_MARGIN_SECS` | Refresh this early | `300` |
    ///
    /// Per provider (`CALCOM_`, `CALENDLY_`, `ZOOM_`): `CLIENT_ID`,
    /// `CLIENT_SECRET`, `WEBHOOK_SECRET`, `REDIRECT_URI`, `API_BASE_URL`,
    /// `AUTHORIZE_URL`, `TOKEN_URL`, `SCOPES`. Stripe: `STRIPE_SECRET_KEY`,
    /// `STRIPE_WEBHOOK_SECRET`, `STRIPE_API_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let addr = var("BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8790".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("BIND_ADDR".to_string()))?;

        let data_dir = var("DATA_DIR").map(PathBuf::from);

        let public_base_url = var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{addr}"))
            .trim_end_matches('/')
            .to_string();

        let state_secret = var("STATE_SIGNING_SECRET")
            .ok_or_else(|| ConfigError::Missing("STATE_SIGNING_SECRET".to_string()))?;
        if state_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "STATE_SIGNING_SECRET must be at least 16 characters".to_string(),
            ));
        }

        let http_timeout = Duration::from_secs(parse_or(&var, "HTTP_TIMEOUT_SECS", 15)?);
        let refresh_margin = Duration::from_secs(parse_or(&var, "TOKEN_REFRESH_MARGIN_SECS", 300)?);

        let failure_threshold = parse_or(&var, "CIRCUIT_FAILURE_THRESHOLD", 5u32)?;
        if failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "CIRCUIT_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        let circuit = CircuitBreakerConfig::default()
            .with_failure_threshold(failure_threshold)
            .with_reset_timeout(Duration::from_millis(parse_or(
                &var,
                "CIRCUIT_RESET_TIMEOUT_MS",
                60_000,
            )?));

        let retry = RetryConfig {
            max_retries: parse_or(&var, "RETRY_MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(parse_or(&var, "RETRY_BASE_DELAY_MS", 500)?),
            max_delay: Duration::from_millis(parse_or(&var, "RETRY_MAX_DELAY_MS", 10_000)?),
            attempt_timeout: http_timeout,
        };

        let mut providers = BTreeMap::new();
        for provider in Provider::ALL {
            if let Some(cfg) = load_provider(provider, &var, &public_base_url) {
                providers.insert(provider, cfg);
            }
        }

        Ok(Self {
            addr,
            data_dir,
            public_base_url,
            state_secret: SecretString::from(state_secret),
            state_ttl: Duration::from_secs(600),
            http_timeout,
            refresh_margin,
            circuit,
            retry,
            providers,
        })
    }

    /// Get the OAuth state signing key (exposes the secret).
    pub(crate) fn state_secret(&self) -> &str {
        self.state_secret.expose_secret()
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }
}

struct ProviderDefaults {
    prefix: &'static str,
    api_base_url: &'static str,
    authorize_url: &'static str,
    token_url: &'static str,
    scopes: &'static str,
}

fn defaults(provider: Provider) -> ProviderDefaults {
    match provider {
        Provider::Calcom => ProviderDefaults {
            prefix: "CALCOM",
            api_base_url: "https://api.cal.com/v2",
            authorize_url: "https://app.cal.com/auth/oauth2/authorize",
            token_url: "https://app.cal.com/api/auth/oauth/token",
            scopes: "READ_BOOKING READ_PROFILE",
        },
        Provider::Calendly => ProviderDefaults {
            prefix: "CALENDLY",
            api_base_url: "https://api.calendly.com",
            authorize_url: "https://auth.calendly.com/oauth/authorize",
            token_url: "https://auth.calendly.com/oauth/token",
            scopes: "",
        },
        Provider::Zoom => ProviderDefaults {
            prefix: "ZOOM",
            api_base_url: "https://api.zoom.us/v2",
            authorize_url: "https://zoom.us/oauth/authorize",
            token_url: "https://zoom.us/oauth/token",
            scopes: "meeting:write meeting:read user:read",
        },
        Provider::Stripe => ProviderDefaults {
            prefix: "STRIPE",
            api_base_url: "https://api.stripe.com/v1",
            authorize_url: "",
            token_url: "",
            scopes: "",
        },
    }
}

fn load_provider<F>(provider: Provider, var: &F, public_base_url: &str) -> Option<ProviderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let d = defaults(provider);
    let key = |name: &str| format!("{}_{name}", d.prefix);

    let api_base_url = var(&key("API_BASE_URL")).unwrap_or_else(|| d.api_base_url.to_string());
    let mut cfg = ProviderConfig::new(provider, api_base_url.trim_end_matches('/'));

    if let Some(secret) = var(&key("WEBHOOK_SECRET")) {
        cfg = cfg.with_webhook_secret(secret);
    }

    if provider == Provider::Stripe {
        if let Some(api_key) = var("STRIPE_SECRET_KEY") {
            cfg = cfg.with_api_key(api_key);
        }
    } else if let (Some(client_id), Some(client_secret)) =
        (var(&key("CLIENT_ID")), var(&key("CLIENT_SECRET")))
    {
        let redirect_uri = var(&key("REDIRECT_URI"))
            .unwrap_or_else(|| format!("{public_base_url}/oauth/{provider}/callback"));
        let scopes = var(&key("SCOPES"))
            .unwrap_or_else(|| d.scopes.to_string())
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        cfg = cfg.with_oauth(OAuthClientConfig::new(
            client_id,
            client_secret,
            redirect_uri,
            var(&key("AUTHORIZE_URL")).unwrap_or_else(|| d.authorize_url.to_string()),
            var(&key("TOKEN_URL")).unwrap_or_else(|| d.token_url.to_string()),
            scopes,
        ));
    }

    let enabled = cfg.oauth.is_some() || cfg.webhook_secret.is_some() || cfg.api_key.is_some();
    enabled.then_some(cfg)
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key.to_string())),
        None => Ok(default),
    }
}

/// Shorten a secret for diagnostics: at most a four character prefix.
pub fn redact(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "****".to_string();
    }
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}…")
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(String),

    #[error("invalid value for {0}")]
    Invalid(String),
}
