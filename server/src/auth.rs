//! OAuth2 client-credentials session for the Piwik PRO API
//!
//! The session caches a single bearer token and refreshes it lazily, right
//! before the call that needs it. Refreshes happen while holding the cache
//! lock, so concurrent callers waiting on an expired token observe exactly
//! one exchange and then share its result.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ClientConfig, Credentials};
use crate::error::{upstream_message, PiwikError, PiwikResult};

/// Path of the client-credentials token endpoint
pub const TOKEN_PATH: &str = "/auth/token";

/// Tokens closer than this to expiry are treated as expired
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Bearer token with its expiry instant
#[derive(Clone)]
pub struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + expires_in,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the token is still usable, keeping a safety margin
    pub fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Owns the credential exchange and the cached token
pub struct AuthSession {
    http: Client,
    token_url: Url,
    credentials: Credentials,
    cached: Mutex<Option<AccessToken>>,
}

impl AuthSession {
    pub fn new(config: &ClientConfig, http: Client) -> Self {
        Self {
            http,
            token_url: config.endpoint(TOKEN_PATH),
            credentials: config.credentials.clone(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid token, exchanging credentials if the cache is empty or stale
    pub async fn get_token(&self) -> PiwikResult<AccessToken> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh() {
                debug!("Using cached Piwik PRO token");
                return Ok(token.clone());
            }
            debug!("Cached Piwik PRO token expired");
        }

        let token = self.exchange().await?;
        debug!(
            "Cached new Piwik PRO token, valid for {:?}",
            token.expires_at().saturating_duration_since(Instant::now())
        );
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token if it is still the one upstream rejected, so the
    /// next `get_token` performs a fresh exchange. A token refreshed by another
    /// caller in the meantime is kept.
    pub async fn invalidate(&self, rejected: &AccessToken) {
        let mut cached = self.cached.lock().await;
        match cached.as_ref() {
            Some(token) if token.value() == rejected.value() => {
                warn!("Discarding rejected Piwik PRO token");
                *cached = None;
            }
            Some(_) => debug!("Rejected token already replaced, keeping cache"),
            None => {}
        }
    }

    async fn exchange(&self) -> PiwikResult<AccessToken> {
        info!("Requesting new Piwik PRO access token");

        let response = self
            .http
            .post(self.token_url.as_str())
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| PiwikError::Auth {
                message: format!("Token endpoint unreachable: {}", e),
                status: None,
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| PiwikError::Auth {
            message: format!("Failed to read token response: {}", e),
            status: Some(status.as_u16()),
        })?;

        if !status.is_success() {
            let message = upstream_message(&text);
            warn!("Token exchange failed ({}): {}", status, message);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(PiwikError::Auth {
                    message: format!("Credentials rejected by Piwik PRO: {}", message),
                    status: Some(status.as_u16()),
                });
            }
            return Err(PiwikError::Upstream {
                status: status.as_u16(),
                message: format!("Token exchange failed: {}", message),
            });
        }

        let body: TokenResponse = serde_json::from_str(&text).map_err(|e| PiwikError::Auth {
            message: format!("Malformed token response: {}", e),
            status: Some(status.as_u16()),
        })?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        info!("Obtained Piwik PRO access token (expires in {}s)", expires_in);

        Ok(AccessToken::new(
            body.access_token,
            Duration::from_secs(expires_in),
        ))
    }
}
