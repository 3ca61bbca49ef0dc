//! Authenticating as the node's device identity.

use super::{basic_value, Transport};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use edgefed_types::{Identity, Principal, RealmSettings};
use reqwest::Method;
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Header carrying device credentials next to the application credentials.
pub const DEVICE_AUTH_HEADER: &str = "X-Device-Authorization";

/// A device principal with its session lifetime.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub principal: Principal,
    pub expires_at: Option<SystemTime>,
}

impl DeviceSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| SystemTime::now() >= exp)
    }
}

/// Exchanges realm credentials for a device session.
#[async_trait]
pub trait DeviceAuthenticator: Send + Sync {
    /// Authenticates the device described by `settings` over `auth`, a
    /// transport bound to the application identity on the authentication
    /// endpoint.
    async fn authenticate(
        &self,
        settings: &RealmSettings,
        auth: &Transport,
    ) -> ClientResult<DeviceSession>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// OAuth client-credentials grant with device credentials in a side header.
#[derive(Debug, Clone)]
pub struct OAuthDeviceAuthenticator {
    token_path: String,
}

impl Default for OAuthDeviceAuthenticator {
    fn default() -> Self {
        Self {
            token_path: "oauth2_token".to_string(),
        }
    }
}

impl OAuthDeviceAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a non-default token path under the authentication endpoint.
    pub fn with_token_path(token_path: impl Into<String>) -> Self {
        Self {
            token_path: token_path.into(),
        }
    }
}

#[async_trait]
impl DeviceAuthenticator for OAuthDeviceAuthenticator {
    async fn authenticate(
        &self,
        settings: &RealmSettings,
        auth: &Transport,
    ) -> ClientResult<DeviceSession> {
        debug!("Authenticating device {}", settings.device_name);

        let device_credentials = basic_value(&settings.device_name, &settings.device_secret);

        let builder = auth
            .request(Method::POST, &self.token_path)?
            .header(DEVICE_AUTH_HEADER, device_credentials)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", settings.application_name.as_str()),
                ("client_secret", settings.application_secret.as_str()),
                ("scope", "*"),
            ]);

        let response = auth.send(builder, &self.token_path).await.map_err(|e| match e {
            ClientError::Status { status, body } if status == 400 || status == 401 => {
                ClientError::Configuration(format!("device authentication rejected: {body}"))
            }
            other => other,
        })?;

        let token: TokenResponse = response.json().await?;
        // Refresh a minute early.
        let expires_at = token
            .expires_in
            .map(|secs| SystemTime::now() + Duration::from_secs(secs.saturating_sub(60)));

        Ok(DeviceSession {
            principal: Principal::Device(Identity::with_session(
                settings.device_name.clone(),
                token.access_token,
            )),
            expires_at,
        })
    }
}
