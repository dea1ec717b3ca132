use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::directory::{AuthScheme, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};

const DEFAULT_SCOPE: &str = "patient/*.read coverage/*.read";
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
/// Longer advertised lifetimes are clamped so tokens still rotate daily
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Kind of secret a provider credential is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    ClientId,
    ClientSecret,
    ApiKey,
    Username,
    Password,
}

impl SecretKind {
    fn env_suffix(&self) -> &'static str {
        match self {
            Self::ClientId => "CLIENT_ID",
            Self::ClientSecret => "CLIENT_SECRET",
            Self::ApiKey => "API_KEY",
            Self::Username => "USERNAME",
            Self::Password => "PASSWORD",
        }
    }
}

/// Where provider secrets come from
pub trait CredentialStore: Send + Sync {
    fn secret(&self, provider_id: &str, kind: SecretKind) -> Option<SecretString>;
}

/// Reads `{PROVIDER_ID}_{KIND}` from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn variable_name(provider_id: &str, kind: SecretKind) -> String {
        format!("{}_{}", provider_id.to_uppercase(), kind.env_suffix())
    }
}

impl CredentialStore for EnvCredentialStore {
    fn secret(&self, provider_id: &str, kind: SecretKind) -> Option<SecretString> {
        std::env::var(Self::variable_name(provider_id, kind))
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::new)
    }
}

/// In-memory store, mainly for tests and embedded deployments
#[derive(Default)]
pub struct StaticCredentialStore {
    secrets: HashMap<(String, SecretKind), String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: impl Into<String>, kind: SecretKind, value: impl Into<String>) -> Self {
        self.secrets.insert((provider_id.into(), kind), value.into());
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn secret(&self, provider_id: &str, kind: SecretKind) -> Option<SecretString> {
        self.secrets
            .get(&(provider_id.to_string(), kind))
            .map(|v| SecretString::new(v.clone()))
    }
}

/// Secret material attached to an outbound provider request
#[derive(Clone)]
pub enum AuthMaterial {
    Bearer(Arc<SecretString>),
    ApiKey(Arc<SecretString>),
    Basic {
        username: String,
        password: Arc<SecretString>,
    },
}

impl AuthMaterial {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Bearer(token) => request.bearer_auth(token.expose_secret()),
            Self::ApiKey(key) => request.header("X-API-Key", key.expose_secret().as_str()),
            Self::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
        }
    }
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Bearer(_) => "Bearer",
            Self::ApiKey(_) => "ApiKey",
            Self::Basic { .. } => "Basic",
        };
        write!(f, "AuthMaterial::{kind}([REDACTED])")
    }
}

/// Cached credential for one provider
#[derive(Clone)]
pub struct CredentialToken {
    pub provider_id: String,
    secret: Arc<SecretString>,
    /// `None` for credentials that never expire
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Acquires, caches and invalidates provider credentials.
///
/// Concurrent callers may race to refresh the same token; either refreshed
/// token is valid, so the last write wins.
pub struct CredentialBroker {
    http: Client,
    store: Arc<dyn CredentialStore>,
    tokens: DashMap<String, CredentialToken>,
    safety_margin: chrono::Duration,
}

impl CredentialBroker {
    pub fn new(http: Client, store: Arc<dyn CredentialStore>, safety_margin: chrono::Duration) -> Self {
        Self {
            http,
            store,
            tokens: DashMap::new(),
            safety_margin,
        }
    }

    /// Credential for the provider, or `None` when none is configured.
    pub async fn acquire(&self, provider: &ProviderProfile) -> EngineResult<Option<AuthMaterial>> {
        match provider.auth_scheme {
            AuthScheme::Oauth2 => {
                if let Some(token) = self.cached(&provider.id) {
                    return Ok(Some(AuthMaterial::Bearer(token)));
                }
                Ok(self.fetch_oauth_token(provider).await?.map(AuthMaterial::Bearer))
            }
            AuthScheme::ApiKey => Ok(self.static_key(provider).map(AuthMaterial::ApiKey)),
            AuthScheme::BearerKey => Ok(self.static_key(provider).map(AuthMaterial::Bearer)),
            AuthScheme::Basic => {
                let username = self.store.secret(&provider.id, SecretKind::Username);
                let password = self.store.secret(&provider.id, SecretKind::Password);
                Ok(username.zip(password).map(|(username, password)| AuthMaterial::Basic {
                    username: username.expose_secret().clone(),
                    password: Arc::new(password),
                }))
            }
        }
    }

    fn static_key(&self, provider: &ProviderProfile) -> Option<Arc<SecretString>> {
        if let Some(key) = self.cached(&provider.id) {
            return Some(key);
        }
        let key = Arc::new(self.store.secret(&provider.id, SecretKind::ApiKey)?);
        self.tokens.insert(
            provider.id.clone(),
            CredentialToken {
                provider_id: provider.id.clone(),
                secret: Arc::clone(&key),
                expires_at: None,
            },
        );
        Some(key)
    }

    /// Drop the cached credential so the next acquire fetches a new one.
    pub fn invalidate(&self, provider_id: &str) {
        if self.tokens.remove(provider_id).is_some() {
            debug!(provider_id, "Invalidated cached credential");
        }
    }

    pub fn clear(&self) {
        self.tokens.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.tokens.len()
    }

    fn cached(&self, provider_id: &str) -> Option<Arc<SecretString>> {
        let now = Utc::now();
        self.tokens
            .get(provider_id)
            .filter(|token| token.is_fresh(now))
            .map(|token| Arc::clone(&token.secret))
    }

    async fn fetch_oauth_token(&self, provider: &ProviderProfile) -> EngineResult<Option<Arc<SecretString>>> {
        let token_url = provider.token_endpoint.as_deref().ok_or_else(|| {
            EligibilityError::Configuration(format!("provider {} has no token endpoint", provider.id))
        })?;
        let client_id = self.store.secret(&provider.id, SecretKind::ClientId);
        let client_secret = self.store.secret(&provider.id, SecretKind::ClientSecret);
        let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
            warn!(provider_id = %provider.id, "No OAuth2 client credentials configured");
            return Ok(None);
        };

        let scope = provider.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id.expose_secret().as_str()),
            ("client_secret", client_secret.expose_secret().as_str()),
            ("scope", scope),
        ];
        let response = self.http.post(token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                400 | 401 | 403 => EligibilityError::AuthenticationFailure(format!(
                    "token endpoint for {} returned HTTP {status}",
                    provider.id
                )),
                _ => EligibilityError::from_status(status),
            });
        }
        let body: TokenResponse = response.json().await.map_err(|e| {
            EligibilityError::AuthenticationFailure(format!(
                "unreadable token response from {}: {}",
                provider.id,
                e.without_url()
            ))
        })?;

        let expires_at = token_expiry(Utc::now(), body.expires_in, self.safety_margin).ok_or_else(|| {
            EligibilityError::MalformedResponse(format!(
                "token response from {} has an invalid expires_in",
                provider.id
            ))
        })?;
        let secret = Arc::new(SecretString::new(body.access_token));
        self.tokens.insert(
            provider.id.clone(),
            CredentialToken {
                provider_id: provider.id.clone(),
                secret: Arc::clone(&secret),
                expires_at: Some(expires_at),
            },
        );
        debug!(provider_id = %provider.id, %expires_at, "Acquired OAuth2 token");
        Ok(Some(secret))
    }
}

/// When a token stops being usable, or `None` if the advertised lifetime is negative.
fn token_expiry(
    now: DateTime<Utc>,
    expires_in: Option<i64>,
    safety_margin: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let secs = expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    if secs < 0 {
        return None;
    }
    let lifetime = chrono::Duration::try_seconds(secs.min(MAX_TOKEN_LIFETIME_SECS))?;
    now.checked_add_signed(lifetime)?.checked_sub_signed(safety_margin)
}
