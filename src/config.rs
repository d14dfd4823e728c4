//! Runtime configuration for token-vault.
//!
//! Configuration can be set via environment variables:
//! - `TOKEN_VAULT_PROJECT_DIR` - Optional. The project root. Defaults to current directory.
//! - `TRAVIS_API_TOKEN` - Optional. Needed only when registering decryption keys.
//! - `TRAVIS_API_URL` - Optional. CI API base URL. Defaults to `https://api.travis-ci.com`.
//! - `TOKEN_VAULT_DRY_RUN` - Optional. Skip remote key registration when truthy.
//! - `TOKEN_VAULT_CLIENT_SECRET` - Optional. Overrides the OAuth client secret from settings.
//!
//! Project-level layout (artifact paths, OAuth app, submission branches) lives in
//! [`crate::settings`].

use std::path::PathBuf;
use thiserror::Error;

use crate::util::env_var_bool;

/// Default Travis CI API endpoint.
pub const DEFAULT_CI_API_URL: &str = "https://api.travis-ci.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// CI provider API configuration.
#[derive(Debug, Clone)]
pub struct CiApiConfig {
    /// API base URL
    pub api_url: String,

    /// API token used for env-var registration
    pub api_token: Option<String>,
}

impl Default for CiApiConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_CI_API_URL.to_string(),
            api_token: None,
        }
    }
}

impl CiApiConfig {
    /// Return the API token or a `MissingEnvVar` error naming `TRAVIS_API_TOKEN`.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.api_token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("TRAVIS_API_TOKEN".to_string()))
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project root that all artifact paths are relative to
    pub project_dir: PathBuf,

    /// CI API settings
    pub ci: CiApiConfig,

    /// Skip remote registration
    pub dry_run: bool,

    /// OAuth client secret override
    pub client_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `TRAVIS_API_URL` is not a valid URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let project_dir = std::env::var("TOKEN_VAULT_PROJECT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let api_url = std::env::var("TRAVIS_API_URL")
            .unwrap_or_else(|_| DEFAULT_CI_API_URL.to_string());
        url::Url::parse(&api_url)
            .map_err(|e| ConfigError::InvalidValue("TRAVIS_API_URL".to_string(), e.to_string()))?;

        let api_token = std::env::var("TRAVIS_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            project_dir,
            ci: CiApiConfig {
                api_url: api_url.trim_end_matches('/').to_string(),
                api_token,
            },
            dry_run: env_var_bool("TOKEN_VAULT_DRY_RUN", false),
            client_secret: std::env::var("TOKEN_VAULT_CLIENT_SECRET").ok(),
        })
    }

    /// Create a config rooted at `project_dir` (useful for testing).
    pub fn new(project_dir: PathBuf) -> Self {
        Self {
            project_dir,
            ci: CiApiConfig::default(),
            dry_run: false,
            client_secret: None,
        }
    }
}
