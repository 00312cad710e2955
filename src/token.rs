//! OAuth token lifecycle for the cloud account
//!
//! One payload behind a mutex: load from memory, then the on-disk cache,
//! then refresh with the configured long-lived credential. Refresh is
//! single-flight: the expiry check is repeated after the lock is acquired,
//! so N concurrent callers racing a near-expired token cause one network
//! refresh, not N.

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Default accounts service base URL.
pub const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Tokens this close to expiry are refreshed eagerly.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Persisted token payload, schema-compatible with the `token.json` cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Unix timestamp of expiry
    pub expires_at: i64,
}

impl TokenPayload {
    /// Whether the token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let now = Utc::now().timestamp();
        self.expires_at - now < margin.as_secs() as i64
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    expires_in: i64,
}

/// Owns the account's token payload and its refresh lifecycle.
pub struct TokenManager {
    http: Client,
    auth: AuthConfig,
    accounts_base: String,
    cache_path: Option<PathBuf>,
    payload: Mutex<Option<TokenPayload>>,
}

impl TokenManager {
    pub fn new(auth: AuthConfig) -> Self {
        let cache_path = auth.token_cache_path();
        Self::with_accounts_base(auth, ACCOUNTS_BASE, Some(cache_path))
    }

    /// Constructor with an explicit accounts base URL and cache path.
    /// `cache_path: None` disables on-disk persistence.
    pub fn with_accounts_base(
        auth: AuthConfig,
        accounts_base: impl Into<String>,
        cache_path: Option<PathBuf>,
    ) -> Self {
        Self {
            http: Client::new(),
            auth,
            accounts_base: accounts_base.into(),
            cache_path,
            payload: Mutex::new(None),
        }
    }

    /// Seed the manager with an existing payload (e.g. from a prior session,
    /// or a fixed token in tests).
    pub fn with_payload(auth: AuthConfig, payload: TokenPayload) -> Self {
        Self::with_accounts_base(auth, ACCOUNTS_BASE, None).seeded(payload)
    }

    /// Pre-populate the in-memory payload.
    pub fn seeded(mut self, payload: TokenPayload) -> Self {
        self.payload = Mutex::new(Some(payload));
        self
    }

    /// Return a valid access token, refreshing transparently when the cached
    /// one is missing or inside the expiry margin.
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        let mut payload = self.payload.lock().await;
        if let Some(current) = payload.as_ref() {
            if !current.expires_within(EXPIRY_MARGIN) {
                return Ok(current.access_token.clone());
            }
        }
        let fresh = self.acquire_locked(&mut payload, false).await?;
        Ok(fresh.access_token)
    }

    /// Refresh if missing or near expiry. Idempotent and safe to call from
    /// every cloud call site; returns whether a refresh actually happened.
    pub async fn refresh_if_needed(&self, force: bool) -> Result<bool, AuthError> {
        let mut payload = self.payload.lock().await;
        if !force {
            if let Some(current) = payload.as_ref() {
                if !current.expires_within(EXPIRY_MARGIN) {
                    return Ok(false);
                }
            }
        }
        self.acquire_locked(&mut payload, force).await?;
        Ok(true)
    }

    /// Acquire a usable payload while the state lock is held.
    /// Source order: disk cache (if still valid), then network refresh with
    /// the best available refresh credential. A forced acquisition skips the
    /// disk adoption: the current token was just rejected, so an unexpired
    /// copy of it is worthless.
    async fn acquire_locked(
        &self,
        payload: &mut Option<TokenPayload>,
        force_network: bool,
    ) -> Result<TokenPayload, AuthError> {
        let disk = self.load_cache();
        if !force_network {
            if let Some(cached) = disk.as_ref() {
                if !cached.expires_within(EXPIRY_MARGIN) {
                    debug!("Adopting still-valid token from cache file");
                    *payload = Some(cached.clone());
                    return Ok(cached.clone());
                }
            }
        }

        // Expired everywhere: find a refresh credential
        let refresh_token = payload
            .as_ref()
            .and_then(|p| p.refresh_token.clone())
            .or_else(|| disk.as_ref().and_then(|p| p.refresh_token.clone()))
            .or_else(|| self.auth.refresh_token.clone())
            .ok_or_else(|| {
                AuthError::NoCredentials(
                    "no cached token and no refresh token configured".to_string(),
                )
            })?;

        let fresh = self.refresh_with(&refresh_token).await?;
        self.store_cache(&fresh);
        *payload = Some(fresh.clone());
        info!("Access token refreshed (expires_at={})", fresh.expires_at);
        Ok(fresh)
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<TokenPayload, AuthError> {
        if self.auth.client_id.is_empty() || self.auth.client_secret.is_empty() {
            return Err(AuthError::NoCredentials(
                "client id/secret not configured".to_string(),
            ));
        }

        let url = format!("{}/api/token", self.accounts_base);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.auth.client_id, Some(&self.auth.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        Ok(TokenPayload {
            access_token: refreshed.access_token,
            // The accounts service may omit the refresh token; keep the old one
            refresh_token: refreshed
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            token_type: refreshed.token_type,
            scope: refreshed.scope,
            expires_at: Utc::now().timestamp() + refreshed.expires_in,
        })
    }

    fn load_cache(&self) -> Option<TokenPayload> {
        let path = self.cache_path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("Token cache at {} is unreadable: {e}", path.display());
                None
            }
        }
    }

    fn store_cache(&self, payload: &TokenPayload) {
        let Some(path) = self.cache_path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create token cache directory: {e}");
                return;
            }
        }
        match serde_json::to_string_pretty(payload) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("Failed to persist token cache: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize token payload: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(expires_in_secs: i64) -> TokenPayload {
        TokenPayload {
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: Some("Bearer".to_string()),
            scope: None,
            expires_at: Utc::now().timestamp() + expires_in_secs,
        }
    }

    #[test]
    fn expiry_margin_check() {
        assert!(!payload(3600).expires_within(EXPIRY_MARGIN));
        assert!(payload(60).expires_within(EXPIRY_MARGIN));
        assert!(payload(-10).expires_within(EXPIRY_MARGIN));
    }

    #[tokio::test]
    async fn seeded_payload_returns_without_network() {
        let manager = TokenManager::with_payload(
            AuthConfig::default(),
            TokenPayload {
                access_token: "seeded".to_string(),
                refresh_token: None,
                token_type: None,
                scope: None,
                expires_at: Utc::now().timestamp() + 3600,
            },
        );

        let token = manager.get_access_token().await.expect("token");
        assert_eq!(token, "seeded");
    }

    #[tokio::test]
    async fn no_credentials_is_a_typed_error() {
        let manager =
            TokenManager::with_accounts_base(AuthConfig::default(), "http://127.0.0.1:1", None);
        let err = manager.get_access_token().await.expect_err("should fail");
        assert!(matches!(err, AuthError::NoCredentials(_)));
    }
}
