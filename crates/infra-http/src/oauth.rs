// OAuth grants: refresh token, authorization code, consent URL

use crate::transport::{base_url_for, map_reqwest_error};
use async_trait::async_trait;
use marketpost_core::domain::{ApiEnvironment, TokenGrant};
use marketpost_core::error::{excerpt, ExternalError};
use marketpost_core::port::TokenEndpoint;
use std::time::Duration;
use tracing::{info, warn};

pub const TOKEN_PATH: &str = "/identity/v1/oauth2/token";
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const SANDBOX_AUTH_HOST: &str = "https://auth.sandbox.ebay.com";
pub const PRODUCTION_AUTH_HOST: &str = "https://auth.ebay.com";

/// Scopes requested by `marketpost auth url` unless configured otherwise
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope/sell.inventory",
    "https://api.ebay.com/oauth/api_scope/sell.account",
];

#[derive(Clone, Default)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Redirect URI (RuName) registered for the authorization-code grant
    pub redirect_uri: Option<String>,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Consent page the account owner visits to obtain an authorization code
pub fn authorize_url(
    environment: ApiEnvironment,
    credentials: &OAuthCredentials,
    scopes: &[String],
) -> Result<String, ExternalError> {
    let redirect_uri = credentials.redirect_uri.as_deref().unwrap_or_default();
    if credentials.client_id.is_empty() || redirect_uri.is_empty() {
        return Err(ExternalError::RefreshFailed(
            "oauth.client_id and oauth.redirect_uri must be configured".to_string(),
        ));
    }
    let host = match environment {
        ApiEnvironment::Sandbox => SANDBOX_AUTH_HOST,
        ApiEnvironment::Production => PRODUCTION_AUTH_HOST,
    };
    let scope = scopes.join(" ");
    let url = reqwest::Url::parse_with_params(
        &format!("{}/oauth2/authorize", host),
        &[
            ("client_id", credentials.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
        ],
    )
    .map_err(|e| ExternalError::RefreshFailed(format!("invalid authorize URL: {}", e)))?;
    Ok(url.into())
}

/// Token endpoint of the identity service
///
/// A 4xx means the grant was refused and is `RefreshFailed`; no response,
/// an unreadable body or a 5xx is `Transient`.
pub struct OAuthTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    credentials: OAuthCredentials,
}

impl OAuthTokenEndpoint {
    pub fn new(environment: ApiEnvironment, credentials: OAuthCredentials) -> Self {
        Self::with_base_url(base_url_for(environment), credentials)
    }

    pub fn with_base_url(base_url: &str, credentials: OAuthCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH),
            credentials,
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn request_grant(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ExternalError> {
        if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
            return Err(ExternalError::RefreshFailed(
                "OAuth client credentials are not configured".to_string(),
            ));
        }

        let transient = |e: reqwest::Error| ExternalError::Transient {
            status: None,
            message: format!(
                "token endpoint: {}",
                map_reqwest_error(e, TOKEN_REQUEST_TIMEOUT)
            ),
            raw: None,
        };

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(form)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        let body = response.text().await.map_err(transient)?;

        if status.is_client_error() {
            warn!(status = status.as_u16(), "Token grant refused");
            return Err(ExternalError::RefreshFailed(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                excerpt(&body)
            )));
        }
        if !status.is_success() {
            return Err(ExternalError::Transient {
                status: Some(status.as_u16()),
                message: "token endpoint unavailable".to_string(),
                raw: Some(excerpt(&body)),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            ExternalError::RefreshFailed(format!("malformed token response: {}", e))
        })
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExternalError> {
        let grant = self
            .request_grant(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;
        info!(expires_in_secs = grant.expires_in_secs, "Access token refreshed");
        Ok(grant)
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ExternalError> {
        let Some(redirect_uri) = self.credentials.redirect_uri.as_deref() else {
            return Err(ExternalError::RefreshFailed(
                "oauth.redirect_uri is not configured".to_string(),
            ));
        };
        let grant = self
            .request_grant(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;
        info!(expires_in_secs = grant.expires_in_secs, "Authorization code exchanged");
        Ok(grant)
    }
}
