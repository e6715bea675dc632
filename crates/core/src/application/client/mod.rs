// Resilient External Client
//
// Transient failures (no response, 429, 5xx) are retried with backoff,
// a 401 triggers one token refresh that is not charged to the retry budget,
// and anything else surfaces immediately.

pub mod classify;
pub mod token;

pub use token::{TokenManager, DEFAULT_TOKEN_ACCOUNT};

use crate::application::retry::BackoffPolicy;
use crate::error::ExternalError;
use crate::port::{ApiRequest, HttpTransport, Sleeper, TimeProvider};
use classify::{classify_status, error_from_response, error_from_transport, StatusClass};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default retry budget per call
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-request timeout (30s)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Successful response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` when empty, a string when not JSON
    pub data: serde_json::Value,
}

fn parse_body(body: &str) -> serde_json::Value {
    if body.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
}

pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenManager,
    sleeper: Arc<dyn Sleeper>,
    time_provider: Arc<dyn TimeProvider>,
    config: ClientConfig,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: TokenManager,
        sleeper: Arc<dyn Sleeper>,
        time_provider: Arc<dyn TimeProvider>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            sleeper,
            time_provider,
            config,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Execute with the configured retry budget
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ExternalError> {
        self.execute_with_retries(request, self.config.max_retries)
            .await
    }

    /// Execute with an explicit retry budget for this call
    pub async fn execute_with_retries(
        &self,
        request: &ApiRequest,
        max_retries: u32,
    ) -> Result<ApiResponse, ExternalError> {
        let mut token = self.tokens.access_token().await?;
        let mut refreshed = false;
        let mut retries = 0u32;

        loop {
            let sent = self
                .transport
                .send(request, &token, self.config.timeout)
                .await;

            let (error, retry_after) = match sent {
                Ok(response) => match classify_status(response.status) {
                    StatusClass::Success => {
                        debug!(
                            method = %request.method,
                            path = %request.path,
                            status = response.status,
                            retries,
                            "External call succeeded"
                        );
                        return Ok(ApiResponse {
                            status: response.status,
                            data: parse_body(&response.body),
                        });
                    }
                    StatusClass::Unauthorized if !refreshed => {
                        warn!(
                            method = %request.method,
                            path = %request.path,
                            "Access token rejected; refreshing once"
                        );
                        refreshed = true;
                        token = self.tokens.refresh_rejected(&token).await?;
                        continue;
                    }
                    _ => error_from_response(&response, self.time_provider.now_millis()),
                },
                Err(transport_error) => (error_from_transport(&transport_error), None),
            };

            if !error.is_retryable() {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    code = error.code(),
                    status = ?error.status(),
                    "External call failed"
                );
                return Err(error);
            }

            if retries >= max_retries {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    retries,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(error);
            }

            let delay = self.config.backoff.delay_for(retries, retry_after);
            warn!(
                method = %request.method,
                path = %request.path,
                attempt = retries + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                status = ?error.status(),
                "Transient failure; backing off"
            );
            self.sleeper.sleep(delay).await;
            retries += 1;
        }
    }
}
