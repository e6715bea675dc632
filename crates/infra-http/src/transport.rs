// reqwest HttpTransport

use async_trait::async_trait;
use marketpost_core::domain::ApiEnvironment;
use marketpost_core::port::{ApiRequest, HttpMethod, HttpTransport, RawResponse, TransportError};
use reqwest::header::{ACCEPT, CONTENT_LANGUAGE, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

pub const SANDBOX_BASE_URL: &str = "https://api.sandbox.ebay.com";
pub const PRODUCTION_BASE_URL: &str = "https://api.ebay.com";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn base_url_for(environment: ApiEnvironment) -> &'static str {
    match environment {
        ApiEnvironment::Sandbox => SANDBOX_BASE_URL,
        ApiEnvironment::Production => PRODUCTION_BASE_URL,
    }
}

/// Marketplace API over HTTPS. Timeouts are per call, from the caller.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(environment: ApiEnvironment) -> Result<Self, TransportError> {
        Self::with_base_url(base_url_for(environment))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// reqwest::Error -> TransportError (orphan rule keeps this a helper)
pub(crate) fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let url = self.url_for(&request.path);
        debug!(method = %request.method, url = %url, "Sending API request");

        let mut builder = self
            .client
            .request(method(request.method), &url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LANGUAGE, "en-US")
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.to_string());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_follows_environment() {
        let sandbox = ReqwestTransport::new(ApiEnvironment::Sandbox).unwrap();
        assert_eq!(sandbox.base_url(), SANDBOX_BASE_URL);
        let production = ReqwestTransport::new(ApiEnvironment::Production).unwrap();
        assert_eq!(production.base_url(), PRODUCTION_BASE_URL);
    }

    #[test]
    fn test_url_join_tolerates_slashes() {
        let transport = ReqwestTransport::with_base_url("http://localhost:9000/").unwrap();
        assert_eq!(
            transport.url_for("/sell/inventory/v1/inventory_item/A1"),
            "http://localhost:9000/sell/inventory/v1/inventory_item/A1"
        );
        assert_eq!(transport.url_for("ping"), "http://localhost:9000/ping");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Port 1 on loopback is not listening
        let transport = ReqwestTransport::with_base_url("http://127.0.0.1:1").unwrap();
        let err = transport
            .send(&ApiRequest::get("/ping"), "token", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::Other(_)
        ));
    }
}
