//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend base URL, request timeout, credential backend, page size and the
//! last username used to sign in.
//!
//! Configuration is stored at `~/.config/crmdesk/config.json`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "crmdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Environment variable overriding the backend base URL
pub const API_URL_ENV: &str = "CRMDESK_API_URL";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Where the credential pair is kept. Defaults to a private file in the data directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    Keyring,
    #[default]
    File,
    Memory,
}

impl CredentialBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialBackend::Keyring => "keyring",
            CredentialBackend::File => "file",
            CredentialBackend::Memory => "memory",
        }
    }
}

impl fmt::Display for CredentialBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(CredentialBackend::Keyring),
            "file" => Ok(CredentialBackend::File),
            "memory" => Ok(CredentialBackend::Memory),
            other => anyhow::bail!("Unknown credential store '{}' (expected keyring, file or memory)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    pub last_username: Option<String>,
    pub page_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            credential_backend: CredentialBackend::default(),
            last_username: None,
            page_size: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Replace the base URL, e.g. from `--api-url` or `CRMDESK_API_URL`.
    /// Blank values are ignored.
    pub fn with_api_url_override(mut self, api_url: Option<String>) -> Self {
        if let Some(url) = api_url.filter(|url| !url.trim().is_empty()) {
            self.api_url = url.trim().to_string();
        }
        self
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the session snapshot and file-backed credentials
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Base URL without a trailing slash
    pub fn api_base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_base_url(), DEFAULT_API_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.credential_backend, CredentialBackend::File);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"credential_backend": "keyring", "unknown": 1}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.credential_backend, CredentialBackend::Keyring);
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            last_username: Some("agent@x.com".to_string()),
            page_size: Some(50),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_api_url_override() {
        let config = Config::default().with_api_url_override(Some("https://crm.example.com/api/".into()));
        assert_eq!(config.api_base_url(), "https://crm.example.com/api");

        let config = Config::default().with_api_url_override(Some("  ".into()));
        assert_eq!(config.api_url, DEFAULT_API_URL);

        let config = Config::default().with_api_url_override(None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_credential_backend_parse() {
        assert_eq!("File".parse::<CredentialBackend>().unwrap(), CredentialBackend::File);
        assert_eq!("keyring".parse::<CredentialBackend>().unwrap(), CredentialBackend::Keyring);
        assert!("vault".parse::<CredentialBackend>().is_err());
        assert_eq!(CredentialBackend::Memory.to_string(), "memory");
    }
}
