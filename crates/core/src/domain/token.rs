// OAuth Token Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

/// A token is refused once it is within this window of expiry (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

/// Which marketplace environment a token was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiEnvironment {
    Sandbox,
    Production,
}

impl ApiEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiEnvironment::Sandbox => "sandbox",
            ApiEnvironment::Production => "production",
        }
    }
}

impl std::fmt::Display for ApiEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApiEnvironment {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(ApiEnvironment::Sandbox),
            "production" => Ok(ApiEnvironment::Production),
            other => Err(DomainError::ValidationError(format!(
                "unknown API environment: {}",
                other
            ))),
        }
    }
}

/// Stored credentials for one external account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<i64>,
    pub environment: Option<ApiEnvironment>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub updated_at: i64,
}

impl TokenRecord {
    /// Access token, if present and valid for longer than `buffer_ms`
    pub fn usable_access_token(&self, now_millis: i64, buffer_ms: i64) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        let expires_at = self.access_token_expires_at?;
        if expires_at - buffer_ms > now_millis {
            Some(token)
        } else {
            None
        }
    }

    /// Merge a refresh grant. A grant without a refresh token keeps the stored one.
    pub fn apply_grant(&mut self, grant: &TokenGrant, environment: ApiEnvironment, now_millis: i64) {
        self.access_token = Some(grant.access_token.clone());
        self.access_token_expires_at = Some(now_millis + grant.expires_in_secs * 1000);
        if let Some(refresh) = &grant.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        if let Some(scope) = &grant.scope {
            self.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        self.environment = Some(environment);
        self.updated_at = now_millis;
    }
}

/// Response of the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(rename = "expires_in")]
    pub expires_in_secs: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
