use crate::api::TokenProvider;
use crate::connection::ReconnectPolicy;
use crate::error::ApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

const KEYRING_SERVICE: &str = "chatsync-token";

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_USER_ID: &str = "local-user";
const DEFAULT_TOKEN_REF: &str = "env:CHATSYNC_TOKEN";
const DEFAULT_STALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Settings for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub database_path: PathBuf,
    pub user_id: String,
    /// Where the bearer token comes from: `env:<VAR>` or `keyring`.
    pub token_ref: String,
    pub reconnect: ReconnectPolicy,
    pub stall_timeout: Duration,
    pub page_size: u32,
    pub sync_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            database_path: default_database_path(),
            user_id: DEFAULT_USER_ID.to_string(),
            token_ref: DEFAULT_TOKEN_REF.to_string(),
            reconnect: ReconnectPolicy::default(),
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            page_size: DEFAULT_PAGE_SIZE,
            sync_interval: None,
        }
    }
}

impl ClientConfig {
    /// Reads `CHATSYNC_*` variables (after loading `.env` if present) on top of the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup("CHATSYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Some(path) = lookup("CHATSYNC_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(user) = lookup("CHATSYNC_USER_ID") {
            config.user_id = user;
        }
        if let Some(token_ref) = lookup("CHATSYNC_TOKEN_REF") {
            config.token_ref = token_ref;
        }
        if let Some(max) = parse_var::<u32>(&lookup, "CHATSYNC_MAX_RETRIES")? {
            config.reconnect.max_retries = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_RETRY_BASE_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_RETRY_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_STALL_TIMEOUT_MS")? {
            config.stall_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<u32>(&lookup, "CHATSYNC_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATSYNC_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Some(Duration::from_secs(secs));
        }
        log::debug!("Loaded client config: {:?}", config);
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value '{}' for {}", raw, key))
        })
        .transpose()
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsync")
        .join("chatsync.sqlite")
}

/// Resolves a credential reference: `env:<VAR>` reads the environment,
/// `keyring` reads the OS keyring entry for `user_id`.
pub fn resolve_credential(token_ref: &str, user_id: &str) -> Result<String> {
    match token_ref {
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving token from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get token from environment variable '{}'",
                env_var_name
            ))
        }
        "keyring" => {
            let entry =
                Entry::new(KEYRING_SERVICE, user_id).context("Failed to create keyring entry")?;
            log::debug!("Retrieving token from keyring for user: {}", user_id);
            entry.get_password().context(format!(
                "Failed to get token from keyring for '{}'",
                user_id
            ))
        }
        other => Err(anyhow::anyhow!("Unsupported token reference format: {}", other)),
    }
}

/// Token provider backed by a credential reference, cached until refreshed.
pub struct CredentialTokenProvider {
    token_ref: String,
    user_id: String,
    cached: RwLock<Option<String>>,
}

impl CredentialTokenProvider {
    pub fn new(token_ref: &str, user_id: &str) -> Self {
        Self {
            token_ref: token_ref.to_string(),
            user_id: user_id.to_string(),
            cached: RwLock::new(None),
        }
    }

    fn resolve(&self) -> Result<String, ApiError> {
        resolve_credential(&self.token_ref, &self.user_id)
            .map_err(|e| ApiError::Credential(format!("{:#}", e)))
    }
}

#[async_trait]
impl TokenProvider for CredentialTokenProvider {
    async fn token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            return Ok(token.clone());
        }
        let token = self.resolve()?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String, ApiError> {
        log::info!("Refreshing bearer token from {}", self.token_ref);
        let token = self.resolve()?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }
}
