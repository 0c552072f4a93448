//! HTTP contract of the backend's session endpoints

use crate::config::ApiConfig;
use crate::{CredentialPair, Identity, RehearseError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Backend operations the session manager depends on
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Resolve the identity behind an access credential. A rejected credential is
    /// reported as [`RehearseError::Unauthorized`].
    async fn fetch_identity(&self, access_token: &str) -> Result<Identity>;

    /// Mint a new credential pair from a refresh credential
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair>;

    /// Tell the backend the session ended. Callers treat this as best effort.
    async fn logout(&self, access_token: &str) -> Result<()>;
}

/// Refresh request body
#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// FastAPI error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    detail: serde_json::Value,
}

/// reqwest implementation against the RehearseKit backend
pub struct HttpSessionApi {
    /// HTTP client for API requests
    client: Client,
    /// API origin
    base_url: Url,
    identity_path: String,
    refresh_path: String,
    logout_path: String,
}

impl HttpSessionApi {
    pub fn new(api_url: &str, config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(RehearseError::Network)?;

        Ok(Self {
            client,
            base_url: normalize_api_url(api_url)?,
            identity_path: config.identity_path.clone(),
            refresh_path: config.refresh_path.clone(),
            logout_path: config.logout_path.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Log the backend's error detail for a failed response, then map the status
    async fn status_error(response: Response) -> RehearseError {
        let status = response.status();
        if let Ok(error) = response.json::<ApiErrorResponse>().await {
            tracing::debug!("Backend rejected request with {}: {}", status, error.detail);
        }

        if status == StatusCode::UNAUTHORIZED {
            RehearseError::Unauthorized
        } else {
            RehearseError::HttpStatus(status.as_u16())
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn fetch_identity(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(self.endpoint(&self.identity_path)?)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(RehearseError::Network)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body = response.bytes().await.map_err(RehearseError::Network)?;
        serde_json::from_slice(&body)
            .map_err(|e| RehearseError::MalformedPayload(format!("identity response: {e}")))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair> {
        let response = self
            .client
            .post(self.endpoint(&self.refresh_path)?)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(RehearseError::Network)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body = response.bytes().await.map_err(RehearseError::Network)?;
        serde_json::from_slice(&body)
            .map_err(|e| RehearseError::MalformedPayload(format!("refresh response: {e}")))
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&self.logout_path)?)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(RehearseError::Network)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        Ok(())
    }
}

/// Normalize an API origin for consistent joining and credential scoping
pub fn normalize_api_url(url: &str) -> Result<Url> {
    let mut normalized = url.trim_end_matches('/').to_string();

    if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
        normalized = format!("https://{normalized}");
    }

    let parsed = Url::parse(&normalized).map_err(RehearseError::UrlParse)?;
    if parsed.host_str().is_none() {
        return Err(RehearseError::Config(format!("API URL has no host: {url}")));
    }

    Ok(parsed)
}
