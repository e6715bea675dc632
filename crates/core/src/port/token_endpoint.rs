// Token Endpoint Port: OAuth grants for the marketplace account

use crate::domain::TokenGrant;
use crate::error::ExternalError;
use async_trait::async_trait;

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Errors should be `ExternalError::RefreshFailed` when the grant is refused
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExternalError>;

    /// Authorization-code grant: trades the code from the consent redirect for tokens
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ExternalError>;
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Issues `fresh-1`, `fresh-2`, ... after an optional delay and counts calls
    pub struct CountingTokenEndpoint {
        calls: AtomicUsize,
        delay: Duration,
        failure: Option<String>,
        expires_in_secs: i64,
    }

    impl CountingTokenEndpoint {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                failure: None,
                expires_in_secs: 7200,
            }
        }

        /// Hold each refresh open so concurrent callers pile up behind it
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                failure: Some(message.into()),
                ..Self::new()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Default for CountingTokenEndpoint {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl TokenEndpoint for CountingTokenEndpoint {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ExternalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = &self.failure {
                return Err(ExternalError::RefreshFailed(message.clone()));
            }
            Ok(TokenGrant {
                access_token: format!("fresh-{}", n),
                expires_in_secs: self.expires_in_secs,
                refresh_token: None,
                scope: None,
            })
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.failure {
                return Err(ExternalError::RefreshFailed(message.clone()));
            }
            Ok(TokenGrant {
                access_token: format!("authorized-{}", code),
                expires_in_secs: self.expires_in_secs,
                refresh_token: Some(format!("refresh-{}", code)),
                scope: None,
            })
        }
    }
}
