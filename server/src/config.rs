use anyhow::{Context, Result};
use std::fmt;
use std::time::Duration;
use url::Url;

/// OAuth2 client credentials for a Piwik PRO account
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub domain: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("domain", &self.domain)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            domain: domain.into(),
        }
    }

    /// Base URL of the account. Bare hosts are served over https.
    pub fn base_url(&self) -> Result<Url> {
        let domain = self.domain.trim().trim_end_matches('/');
        let raw = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        };
        Url::parse(&raw).with_context(|| format!("Invalid Piwik PRO domain: {}", self.domain))
    }
}

/// Runtime settings shared by the auth session and the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub base_url: Url,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self> {
        let base_url = credentials.base_url()?;
        Ok(Self {
            credentials,
            base_url,
            timeout,
        })
    }

    /// Absolute URL for an API path such as `/api/apps/v2`
    pub fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", prefix, path));
        url
    }
}
