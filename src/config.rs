//! Configuration for the certsync server and sync client

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::RetryPolicy;

/// certsync configuration (server and client share one file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the server's SQLite report store
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// The hashed API token (argon2 hash, or plain text for backwards compat)
    pub token_hash: String,
}

/// Where the local sync client keeps drafts and which server it talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Plain API token issued by `certsync token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Local draft store (documents and sync queue)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
}

/// Sync engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Quiet period before edits are turned into a queued operation
    pub debounce_ms: u64,
    /// Cloud calls in flight at once, across all reports
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// In-flight operations older than this are assumed lost and re-sent
    pub stale_in_flight_secs: u64,
    pub poll_interval_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_db_path() -> PathBuf {
    PathBuf::from("certsync.sqlite")
}

fn default_server_url() -> String {
    "http://127.0.0.1:3030".to_string()
}

fn default_data_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("certsync"))
        .unwrap_or_else(|| PathBuf::from(".certsync"))
        .join("drafts.sqlite")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            data_path: default_data_path(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 800,
            max_concurrency: 4,
            request_timeout_secs: 15,
            max_attempts: 10,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            stale_in_flight_secs: 60,
            poll_interval_secs: 5,
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stale_in_flight(&self) -> Duration {
        Duration::from_secs(self.stale_in_flight_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.backoff_base_ms.max(1)),
            cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms).max(1)),
            max_attempts: self.max_attempts.max(1),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("CERTSYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("certsync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# certsync configuration\n\n\
             {content}\n\n\
             # Add tokens with: certsync token --name <device-name>\n"
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Check if a token is valid (supports both hashed and legacy plain tokens)
    pub fn validate_token(&self, token: &str) -> bool {
        let argon2 = Argon2::default();

        self.tokens.iter().any(|t| match PasswordHash::new(&t.token_hash) {
            Ok(parsed_hash) => argon2
                .verify_password(token.as_bytes(), &parsed_hash)
                .is_ok(),
            // Legacy plain-text entry
            Err(_) => t.token_hash == token,
        })
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}
