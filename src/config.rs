//! TOML configuration for the Result Archive Store.
//!
//! Only `[store].url` is required; every other setting has a default.
//!
//! ```toml
//! [store]
//! url = "http://localhost:5984"
//! namespace = "galasa"
//!
//! [log]
//! batch_lines = 100
//!
//! [retry]
//! max_attempts = 10
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ras_core::models::Collections;
use ras_core::server::{ServerRequirements, ServerVersion};

#[derive(Debug, Deserialize, Clone)]
pub struct RasConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Environment variable holding the bearer token, if any.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default = "default_product")]
    pub product: String,
}

fn default_namespace() -> String {
    "galasa".to_string()
}
fn default_token_env() -> String {
    "RAS_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_version() -> String {
    "3.3.0".to_string()
}
fn default_product() -> String {
    "Welcome".to_string()
}

impl StoreConfig {
    pub fn collections(&self) -> Collections {
        Collections::for_namespace(&self.namespace)
    }

    pub fn requirements(&self) -> Result<ServerRequirements> {
        let min_version: ServerVersion = self
            .min_version
            .parse()
            .with_context(|| format!("store.min_version '{}'", self.min_version))?;
        Ok(ServerRequirements {
            product: self.product.clone(),
            min_version,
        })
    }

    /// Bearer token from the configured environment variable.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,
    /// Seconds between background flushes; 0 disables them.
    #[serde(default)]
    pub flush_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_lines: default_batch_lines(),
            flush_interval_secs: 0,
        }
    }
}

fn default_batch_lines() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempts for run-document updates. Every attempt presents the
    /// last revision this process wrote, so values above 1 only ride out
    /// transient conflicts; a second writer still ends the run.
    #[serde(default = "default_run_document_attempts")]
    pub run_document_attempts: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            run_document_attempts: default_run_document_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}
fn default_run_document_attempts() -> u32 {
    1
}
fn default_min_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    /// Parent directory for artifact cache sessions; system temp if unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl RasConfig {
    /// Defaults for everything except the store URL.
    pub fn for_url(url: &str) -> Self {
        Self {
            store: StoreConfig {
                url: url.to_string(),
                namespace: default_namespace(),
                token_env: default_token_env(),
                timeout_secs: default_timeout_secs(),
                min_version: default_min_version(),
                product: default_product(),
            },
            log: LogConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.store.url.trim();
        if url.is_empty() {
            bail!("store.url must be set");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("store.url must be an http(s) URL, got '{}'", url);
        }
        if self.store.namespace.is_empty() {
            bail!("store.namespace must not be empty");
        }
        self.store.requirements()?;

        if self.log.batch_lines == 0 {
            bail!("log.batch_lines must be > 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.retry.run_document_attempts == 0 {
            bail!("retry.run_document_attempts must be > 0");
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.min_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.min_delay_ms,
                self.retry.max_delay_ms
            );
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<RasConfig> {
    let config: RasConfig =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<RasConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
