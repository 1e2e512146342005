//! Device-flow contract against the external OAuth provider.
//!
//! The provider is an opaque collaborator: we start a device authorization,
//! poll its token endpoint, and fetch a profile once authorized. Everything
//! behind [`IdentityProvider`] so the auth service can be driven by a fake
//! in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OAuthConfig;
use crate::error::Error;

/// What `StartLogin` hands back to the client, verbatim from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// Profile fields the provider exposes once the user approves.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub external_id: String,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Outcome of one token poll.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Authorized(ProviderProfile),
    /// User hasn't approved yet; keep polling.
    Pending,
    /// Provider asked us to back off harder.
    SlowDown,
    Denied,
    Expired,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn start_device_flow(&self) -> Result<DeviceAuthorization, Error>;
    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll, Error>;
}

// ── HTTP implementation ────────────────────────────────────────────────

pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: OAuthConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    id: serde_json::Value,
    login: Option<String>,
    name: Option<String>,
    avatar_url: Option<String>,
}

impl HttpIdentityProvider {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ProviderProfile, Error> {
        let info: UserInfoResponse = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("userinfo request failed: {e}");
                Error::Unavailable("identity provider unreachable".into())
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::warn!("userinfo decode failed: {e}");
                Error::Unavailable("identity provider returned malformed profile".into())
            })?;

        // Provider ids come back as either numbers or strings.
        let external_id = match info.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let handle = info.login.unwrap_or_else(|| external_id.clone());
        Ok(ProviderProfile {
            display_name: info.name.unwrap_or_else(|| handle.clone()),
            external_id,
            handle,
            avatar_url: info.avatar_url,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn start_device_flow(&self) -> Result<DeviceAuthorization, Error> {
        let resp = self
            .http
            .post(&self.config.device_auth_url)
            .form(&[("client_id", self.config.client_id.as_str())])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("device authorization request failed: {e}");
                Error::Unavailable("identity provider unreachable".into())
            })?;
        resp.json().await.map_err(|e| {
            tracing::warn!("device authorization decode failed: {e}");
            Error::Unavailable("identity provider returned malformed response".into())
        })
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll, Error> {
        let resp: TokenResponse = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("device_code", device_code),
                (
                    "grant_type",
                    "urn:ietf:params:oauth:grant-type:device_code",
                ),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("token poll failed: {e}");
                Error::Unavailable("identity provider unreachable".into())
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::warn!("token poll decode failed: {e}");
                Error::Unavailable("identity provider returned malformed response".into())
            })?;

        if let Some(token) = resp.access_token {
            return Ok(DevicePoll::Authorized(self.fetch_profile(&token).await?));
        }
        match resp.error.as_deref() {
            Some("authorization_pending") => Ok(DevicePoll::Pending),
            Some("slow_down") => Ok(DevicePoll::SlowDown),
            Some("access_denied") => Ok(DevicePoll::Denied),
            Some("expired_token") => Ok(DevicePoll::Expired),
            // Anything else is surfaced verbatim.
            Some(other) => Err(Error::Unauthenticated(other.to_string())),
            None => Err(Error::Unavailable(
                "identity provider returned neither token nor error".into(),
            )),
        }
    }
}
