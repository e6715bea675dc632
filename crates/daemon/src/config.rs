// Daemon settings: TOML file layered under MARKETPOST_* environment variables

use anyhow::{bail, Context, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use marketpost_core::application::retry::{AttemptPolicy, BackoffPolicy};
use marketpost_core::application::{ClientConfig, TokenManager};
use marketpost_core::domain::{ApiEnvironment, DestinationLimits, DEFAULT_DUPLICATE_WINDOW_MS};
use marketpost_core::port::{HttpMethod, MaintenanceConfig, TimeProvider, VersionedStore};
use marketpost_infra_http::{OAuthCredentials, OAuthTokenEndpoint, DEFAULT_SCOPES};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PREFIX: &str = "MARKETPOST";
pub const ENV_SEPARATOR: &str = "__";
pub const CONFIG_FILE_ENV: &str = "MARKETPOST_CONFIG_FILE";
pub const LOG_FORMAT_ENV: &str = "MARKETPOST_LOG_FORMAT";
pub const DEFAULT_CONFIG_FILE: &str = "config/marketpost.toml";
pub const DB_FILE_NAME: &str = "marketpost.db";

const MINUTE_MS: i64 = 60_000;

/// Per-destination cadence shipped with the daemon; a config file adds to these
const DEFAULT_RATE_LIMITS: &[(&str, i64, i64)] = &[
    ("facebook", 10, 15 * MINUTE_MS),
    ("craigslist", 20, 30 * MINUTE_MS),
];

const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub worker: WorkerSettings,
    pub rate_limits: HashMap<String, RateLimitSettings>,
    pub api: ApiSettings,
    pub oauth: OAuthSettings,
    pub destinations: HashMap<String, DestinationSettings>,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// File path (`~` expanded) or a full `sqlite:` URL
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub id: String,
    pub poll_interval_ms: u64,
    pub lease_duration_ms: i64,
    /// Absent means reclaim forever
    pub max_attempts: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            id: format!("worker-{}", std::process::id()),
            poll_interval_ms: 5_000,
            lease_duration_ms: 15 * MINUTE_MS,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitSettings {
    pub max_per_day: u32,
    pub min_gap_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub environment: String,
    /// Overrides the environment's base URL
    pub base_url: Option<String>,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub max_delay_ms: u64,
    pub token_expiry_buffer_ms: i64,
    pub duplicate_window_ms: i64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            environment: ApiEnvironment::Sandbox.as_str().to_string(),
            base_url: None,
            max_retries: 3,
            request_timeout_ms: 30_000,
            base_delay_ms: 1_000,
            max_jitter_ms: 1_000,
            max_delay_ms: 60_000,
            token_expiry_buffer_ms: 5 * MINUTE_MS,
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    /// Seeds the token record when none is stored yet
    pub refresh_token: Option<String>,
    /// Redirect URI (RuName) for the authorization-code grant
    pub redirect_uri: Option<String>,
    /// Scopes requested on the consent page; empty means the marketplace defaults
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Where a destination's listing is sent through the API client
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSettings {
    #[serde(default = "default_destination_method")]
    pub method: HttpMethod,
    /// `{id}` is replaced with the subject id
    pub path: String,
}

fn default_destination_method() -> HttpMethod {
    HttpMethod::Put
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub enabled: bool,
    pub interval_hours: u64,
    pub finished_job_retention_days: i64,
    pub posting_history_retention_days: i64,
    pub max_db_size_mb: f64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        let defaults = MaintenanceConfig::default();
        Self {
            enabled: true,
            interval_hours: 24,
            finished_job_retention_days: defaults.finished_job_retention_days,
            posting_history_retention_days: defaults.posting_history_retention_days,
            max_db_size_mb: defaults.max_db_size_mb,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `pretty` or `json`
    pub format: String,
    /// EnvFilter directive used when RUST_LOG is unset
    pub filter: String,
    /// Daily rolling log files go here when set
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            filter: "marketpost=info".to_string(),
            directory: None,
            file_prefix: "marketpost.log".to_string(),
        }
    }
}

impl Settings {
    /// Load from `MARKETPOST_CONFIG_FILE` (or the default path, if present) and the environment
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_FILE_ENV).ok();
        let (path, required) = match explicit {
            Some(path) => (path, true),
            None => (DEFAULT_CONFIG_FILE.to_string(), false),
        };

        let builder = Config::builder().add_source(
            File::new(&path, FileFormat::Toml).required(required),
        );
        let builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .set_override_option("logging.format", std::env::var(LOG_FORMAT_ENV).ok())
            .context("Invalid MARKETPOST_LOG_FORMAT")?;

        Self::from_builder(builder).with_context(|| format!("Failed to load settings from {}", path))
    }

    /// Inline TOML, layered over the built-in defaults
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::from_builder(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    fn from_builder(
        mut builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        for (destination, max_per_day, min_gap_ms) in DEFAULT_RATE_LIMITS {
            builder = builder
                .set_default(format!("rate_limits.{}.max_per_day", destination), *max_per_day)?
                .set_default(format!("rate_limits.{}.min_gap_ms", destination), *min_gap_ms)?;
        }

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.id.trim().is_empty() {
            bail!("worker.id must not be empty");
        }
        if self.worker.poll_interval_ms == 0 {
            bail!("worker.poll_interval_ms must be greater than 0");
        }
        if self.worker.lease_duration_ms <= 0 {
            bail!("worker.lease_duration_ms must be greater than 0");
        }
        for (destination, limits) in &self.rate_limits {
            if limits.max_per_day == 0 {
                bail!("rate_limits.{}.max_per_day must be greater than 0", destination);
            }
            if limits.min_gap_ms < 0 {
                bail!("rate_limits.{}.min_gap_ms must not be negative", destination);
            }
        }
        self.api_environment()?;
        if self.api.request_timeout_ms == 0 {
            bail!("api.request_timeout_ms must be greater than 0");
        }
        if self.api.max_jitter_ms > self.api.base_delay_ms {
            bail!(
                "api.max_jitter_ms ({}) must not exceed api.base_delay_ms ({})",
                self.api.max_jitter_ms,
                self.api.base_delay_ms
            );
        }
        if self.api.max_delay_ms < self.api.base_delay_ms {
            bail!("api.max_delay_ms must be at least api.base_delay_ms");
        }
        if self.maintenance.enabled && self.maintenance.interval_hours == 0 {
            bail!("maintenance.interval_hours must be greater than 0");
        }
        for (destination, target) in &self.destinations {
            if target.path.trim().is_empty() {
                bail!("destinations.{}.path must not be empty", destination);
            }
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            bail!(
                "logging.format must be one of {:?}, got {}",
                VALID_LOG_FORMATS,
                self.logging.format
            );
        }
        Ok(())
    }

    pub fn api_environment(&self) -> Result<ApiEnvironment> {
        self.api
            .environment
            .parse()
            .map_err(|e| anyhow::anyhow!("api.environment: {}", e))
    }

    /// SQLite URL for the configured database path
    pub fn database_url(&self) -> Result<String> {
        let path = match &self.database.path {
            Some(path) if path.starts_with("sqlite:") => return Ok(path.clone()),
            Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
            None => default_database_path()?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        Ok(format!("sqlite://{}", path.display()))
    }

    pub fn rate_limits(&self) -> HashMap<String, DestinationLimits> {
        self.rate_limits
            .iter()
            .map(|(destination, l)| {
                (
                    destination.clone(),
                    DestinationLimits::new(l.max_per_day, l.min_gap_ms),
                )
            })
            .collect()
    }

    pub fn attempt_policy(&self) -> AttemptPolicy {
        AttemptPolicy::from_limit(self.worker.max_attempts)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_retries: self.api.max_retries,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.api.base_delay_ms),
                Duration::from_millis(self.api.max_jitter_ms),
                Duration::from_millis(self.api.max_delay_ms),
            ),
            timeout: Duration::from_millis(self.api.request_timeout_ms),
        }
    }

    pub fn oauth_credentials(&self) -> OAuthCredentials {
        OAuthCredentials {
            client_id: self.oauth.client_id.clone(),
            client_secret: self.oauth.client_secret.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
        }
    }

    pub fn oauth_scopes(&self) -> Vec<String> {
        if self.oauth.scopes.is_empty() {
            DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
        } else {
            self.oauth.scopes.clone()
        }
    }

    /// Consent page URL for the authorization-code grant
    pub fn authorize_url(&self) -> Result<String> {
        let url = marketpost_infra_http::authorize_url(
            self.api_environment()?,
            &self.oauth_credentials(),
            &self.oauth_scopes(),
        )?;
        Ok(url)
    }

    /// Token manager for the configured environment, backed by `store`
    pub fn token_manager(
        &self,
        store: Arc<dyn VersionedStore>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<TokenManager> {
        let environment = self.api_environment()?;
        let endpoint = match &self.api.base_url {
            Some(base_url) => OAuthTokenEndpoint::with_base_url(base_url, self.oauth_credentials()),
            None => OAuthTokenEndpoint::new(environment, self.oauth_credentials()),
        };
        Ok(
            TokenManager::new(store, Arc::new(endpoint), time_provider, environment)
                .with_expiry_buffer_ms(self.api.token_expiry_buffer_ms),
        )
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            finished_job_retention_days: self.maintenance.finished_job_retention_days,
            posting_history_retention_days: self.maintenance.posting_history_retention_days,
            max_db_size_mb: self.maintenance.max_db_size_mb,
        }
    }
}

fn default_database_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "marketpost", "marketpost")
        .context("Could not determine a data directory; set database.path")?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}

/// Log directory with `~` expanded
pub fn expand_dir(dir: &str) -> PathBuf {
    Path::new(shellexpand::tilde(dir).as_ref()).to_path_buf()
}
