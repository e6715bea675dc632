// Token Manager: validity checks, environment guard and single-flight refresh

use crate::domain::{ApiEnvironment, TokenGrant, TokenRecord, DEFAULT_TOKEN_EXPIRY_BUFFER_MS};
use crate::error::{AppError, ExternalError};
use crate::port::store::{read_as, Versioned};
use crate::port::{
    Collection, CommitOutcome, TimeProvider, TokenEndpoint, VersionedStore, Write,
    MAX_CONFLICT_RETRIES,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Store key of the token record when only one account is configured
pub const DEFAULT_TOKEN_ACCOUNT: &str = "marketplace";

type RefreshFuture = Shared<BoxFuture<'static, Result<String, ExternalError>>>;

fn store_error(err: AppError) -> ExternalError {
    ExternalError::TokenStore(err.to_string())
}

struct Inner {
    store: Arc<dyn VersionedStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    time_provider: Arc<dyn TimeProvider>,
    environment: ApiEnvironment,
    account: String,
    expiry_buffer_ms: i64,
    /// The one refresh in flight, shared by every caller that needs it
    in_flight: Mutex<Option<RefreshFuture>>,
}

/// Cheap to clone; clones share the in-flight refresh
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        time_provider: Arc<dyn TimeProvider>,
        environment: ApiEnvironment,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                endpoint,
                time_provider,
                environment,
                account: DEFAULT_TOKEN_ACCOUNT.to_string(),
                expiry_buffer_ms: DEFAULT_TOKEN_EXPIRY_BUFFER_MS,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Builder-style settings; only valid before the manager is shared
    pub fn with_account(self, account: impl Into<String>) -> Self {
        self.reconfigure(|inner| inner.account = account.into())
    }

    pub fn with_expiry_buffer_ms(self, buffer_ms: i64) -> Self {
        self.reconfigure(|inner| inner.expiry_buffer_ms = buffer_ms)
    }

    fn reconfigure(self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("TokenManager already shared; ignoring reconfiguration");
                Self { inner: shared }
            }
        }
    }

    pub fn environment(&self) -> ApiEnvironment {
        self.inner.environment
    }

    /// A usable access token, refreshing if the stored one is missing or near expiry
    pub async fn access_token(&self) -> Result<String, ExternalError> {
        let mut seen = None;
        if let Some(record) = self.inner.load().await? {
            self.inner.check_environment(&record.value)?;
            let now = self.inner.time_provider.now_millis();
            if let Some(token) = record
                .value
                .usable_access_token(now, self.inner.expiry_buffer_ms)
            {
                return Ok(token.to_string());
            }
            seen = record.value.access_token;
        }
        self.refresh_superseding(Some(seen.unwrap_or_default())).await
    }

    /// Replacement for a token the server just rejected with 401
    ///
    /// If another caller already stored a newer valid token it is reused.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String, ExternalError> {
        self.refresh_superseding(Some(rejected.to_string())).await
    }

    /// Unconditional refresh: joins the one in flight or calls the endpoint
    pub async fn refresh(&self) -> Result<String, ExternalError> {
        self.refresh_superseding(None).await
    }

    /// Join the in-flight refresh, or start one that replaces `superseded`
    ///
    /// With `Some(token)` the refresh first re-reads the record and returns any
    /// usable token other than `token` without calling the endpoint, so a caller
    /// whose read predates a settled refresh does not rotate the token again.
    async fn refresh_superseding(&self, superseded: Option<String>) -> Result<String, ExternalError> {
        let future = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Token refresh already in progress; waiting");
                    pending.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let pending = async move {
                        let result = inner.do_refresh(superseded.as_deref()).await;
                        inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .take();
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        future.await
    }

    /// Persist a grant obtained out of band (initial authorization)
    pub async fn store_grant(&self, grant: &TokenGrant) -> Result<TokenRecord, ExternalError> {
        self.inner.save_grant(grant).await
    }

    /// Trade a consent-redirect code for tokens and store them for this environment
    pub async fn authorize_with_code(&self, code: &str) -> Result<TokenRecord, ExternalError> {
        let grant = self.inner.endpoint.exchange_code(code).await?;
        let record = self.inner.save_grant(&grant).await?;
        info!(account = %self.inner.account, environment = %self.inner.environment, "Account authorized");
        Ok(record)
    }

    /// Replace the stored refresh token (e.g. after the old one was revoked)
    ///
    /// The cached access token is dropped so the next call refreshes with the
    /// new credentials; the record is re-stamped with the configured environment.
    pub async fn install_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenRecord, ExternalError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = self.inner.load().await?;
            let version = existing.as_ref().map(|r| r.version);
            let scopes = existing.map(|r| r.value.scopes).unwrap_or_default();
            let record = TokenRecord {
                access_token: None,
                refresh_token: Some(refresh_token.to_string()),
                access_token_expires_at: None,
                environment: Some(self.inner.environment),
                scopes,
                updated_at: self.inner.time_provider.now_millis(),
            };
            let write = Write::put(Collection::Tokens, self.inner.account.clone(), version, &record)
                .map_err(store_error)?;
            match self.inner.store.commit(vec![write]).await.map_err(store_error)? {
                CommitOutcome::Committed => {
                    info!(account = %self.inner.account, environment = %self.inner.environment, "Refresh token replaced");
                    return Ok(record);
                }
                CommitOutcome::Conflict => continue,
            }
        }
        Err(ExternalError::TokenStore(format!(
            "token record {} kept changing during install",
            self.inner.account
        )))
    }

    /// Create the token record from a configured refresh token if none exists yet
    ///
    /// Returns whether a record was created.
    pub async fn seed_refresh_token(&self, refresh_token: &str) -> Result<bool, ExternalError> {
        let record = TokenRecord {
            access_token: None,
            refresh_token: Some(refresh_token.to_string()),
            access_token_expires_at: None,
            environment: Some(self.inner.environment),
            scopes: Vec::new(),
            updated_at: self.inner.time_provider.now_millis(),
        };
        let write = Write::insert(Collection::Tokens, self.inner.account.clone(), &record)
            .map_err(store_error)?;
        match self.inner.store.commit(vec![write]).await.map_err(store_error)? {
            CommitOutcome::Committed => {
                info!(account = %self.inner.account, "Seeded token record from configuration");
                Ok(true)
            }
            CommitOutcome::Conflict => Ok(false),
        }
    }
}

impl Inner {
    async fn load(&self) -> Result<Option<Versioned<TokenRecord>>, ExternalError> {
        read_as::<TokenRecord>(self.store.as_ref(), Collection::Tokens, &self.account)
            .await
            .map_err(store_error)
    }

    fn check_environment(&self, record: &TokenRecord) -> Result<(), ExternalError> {
        match record.environment {
            Some(stored) if stored != self.environment => Err(ExternalError::EnvironmentMismatch {
                stored: stored.to_string(),
                configured: self.environment.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn do_refresh(&self, superseded: Option<&str>) -> Result<String, ExternalError> {
        let record = self.load().await?.ok_or_else(|| {
            ExternalError::RefreshFailed("no stored token record; authorize first".to_string())
        })?;
        self.check_environment(&record.value)?;
        if let Some(superseded) = superseded {
            let now = self.time_provider.now_millis();
            if let Some(token) = record.value.usable_access_token(now, self.expiry_buffer_ms) {
                if token != superseded {
                    debug!("Token already replaced by a concurrent refresh");
                    return Ok(token.to_string());
                }
            }
        }
        let refresh_token = record.value.refresh_token.clone().ok_or_else(|| {
            ExternalError::RefreshFailed("no refresh token stored; authorize first".to_string())
        })?;

        let grant = self
            .endpoint
            .refresh(&refresh_token)
            .await
            .map_err(|err| match err {
                ExternalError::RefreshFailed(_) => err,
                other => ExternalError::RefreshFailed(other.to_string()),
            })?;

        self.save_grant(&grant).await?;
        info!(account = %self.account, environment = %self.environment, "Access token refreshed");
        Ok(grant.access_token)
    }

    /// Merge the grant into the stored record with a version-checked write
    async fn save_grant(&self, grant: &TokenGrant) -> Result<TokenRecord, ExternalError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = self.load().await?;
            let version = existing.as_ref().map(|r| r.version);
            let mut record = existing.map(|r| r.value).unwrap_or(TokenRecord {
                access_token: None,
                refresh_token: None,
                access_token_expires_at: None,
                environment: None,
                scopes: Vec::new(),
                updated_at: 0,
            });
            record.apply_grant(grant, self.environment, self.time_provider.now_millis());

            let write = Write::put(Collection::Tokens, self.account.clone(), version, &record)
                .map_err(store_error)?;
            match self.store.commit(vec![write]).await.map_err(store_error)? {
                CommitOutcome::Committed => return Ok(record),
                CommitOutcome::Conflict => continue,
            }
        }
        Err(ExternalError::TokenStore(format!(
            "token record {} kept changing during save",
            self.account
        )))
    }
}
