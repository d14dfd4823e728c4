//! Project settings storage.
//!
//! Persists the project's token-vault layout to disk at
//! `{project_dir}/.token-vault/settings.json`. Defaults describe the
//! conventional layout (token fixture under `tests/testthat`, `.gitignore`,
//! `.Rbuildignore`, `.travis.yml`) and are used when no settings file exists.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

use crate::oauth::OAuthApp;
use crate::util::with_suffix;

/// Settings file location relative to the project root.
pub const SETTINGS_PATH: &str = ".token-vault/settings.json";

/// Suffix appended to the plaintext path to name the encrypted artifact.
pub const DEFAULT_ENCRYPTED_SUFFIX: &str = ".enc";

/// Where each artifact lives, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    /// Plaintext credential file.
    pub token: PathBuf,
    /// Suffix for the encrypted credential file.
    pub encrypted_suffix: String,
    /// Version-control ignore list.
    pub vcs_ignore: PathBuf,
    /// Package-distribution ignore list.
    pub dist_ignore: PathBuf,
    /// CI configuration file.
    pub ci_config: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            token: PathBuf::from("tests/testthat/token.json"),
            encrypted_suffix: DEFAULT_ENCRYPTED_SUFFIX.to_string(),
            vcs_ignore: PathBuf::from(".gitignore"),
            dist_ignore: PathBuf::from(".Rbuildignore"),
            ci_config: PathBuf::from(".travis.yml"),
        }
    }
}

impl ArtifactPaths {
    /// Path of the encrypted artifact.
    pub fn encrypted(&self) -> PathBuf {
        with_suffix(&self.token, &self.encrypted_suffix)
    }

    /// Every path must be relative and stay inside the project; ignore
    /// entries and CI steps are rendered from them verbatim.
    pub fn validate(&self) -> Result<(), String> {
        for (name, path) in [
            ("token", &self.token),
            ("vcs_ignore", &self.vcs_ignore),
            ("dist_ignore", &self.dist_ignore),
            ("ci_config", &self.ci_config),
        ] {
            let inside = path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !inside || path.file_name().is_none() {
                return Err(format!(
                    "paths.{} must be a relative path inside the project, got {:?}",
                    name,
                    path.display().to_string()
                ));
            }
        }
        if self.encrypted_suffix.is_empty() || self.encrypted_suffix.contains(['/', '\\']) {
            return Err(format!(
                "paths.encrypted_suffix must be a non-empty file suffix, got {:?}",
                self.encrypted_suffix
            ));
        }
        Ok(())
    }
}

/// Project settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Artifact layout.
    pub paths: ArtifactPaths,
    /// OAuth application used by `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthApp>,
    /// Branches on which the plaintext token is excluded from package builds.
    pub submission_branches: Vec<String>,
    /// Repository slug override; wins over git metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: ArtifactPaths::default(),
            oauth: None,
            submission_branches: vec!["cran".to_string()],
            slug: None,
        }
    }
}

/// In-memory store for project settings with disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    settings: RwLock<Settings>,
    storage_path: PathBuf,
}

impl SettingsStore {
    /// Create a new settings store, loading from disk if available.
    pub async fn new(project_dir: &Path) -> Self {
        let storage_path = project_dir.join(SETTINGS_PATH);

        let settings = if storage_path.exists() {
            match Self::load_from_path(&storage_path) {
                Ok(s) => {
                    tracing::debug!("Loaded settings from {}", storage_path.display());
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, using defaults",
                        storage_path.display(),
                        e
                    );
                    Settings::default()
                }
            }
        } else {
            tracing::debug!(
                "No settings file found at {}, using defaults",
                storage_path.display()
            );
            Settings::default()
        };

        Self {
            settings: RwLock::new(settings),
            storage_path,
        }
    }

    fn load_from_path(path: &Path) -> Result<Settings, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        settings
            .paths
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(settings)
    }

    async fn save_to_disk(&self) -> Result<(), std::io::Error> {
        let settings = self.settings.read().await;

        if let Some(parent) = self.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(&*settings)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        tokio::fs::write(&self.storage_path, contents).await?;
        tracing::debug!("Saved settings to {}", self.storage_path.display());
        Ok(())
    }

    /// Get a clone of the current settings.
    pub async fn get(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Location of the backing file.
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Replace the OAuth application and persist.
    pub async fn set_oauth_app(&self, app: OAuthApp) -> Result<(), std::io::Error> {
        let mut settings = self.settings.write().await;
        settings.oauth = Some(app);
        drop(settings);
        self.save_to_disk().await
    }

    /// Update the slug override.
    ///
    /// Returns `(changed, previous_value)`.
    pub async fn set_slug(
        &self,
        slug: Option<String>,
    ) -> Result<(bool, Option<String>), std::io::Error> {
        let mut settings = self.settings.write().await;
        let previous = settings.slug.clone();

        if previous != slug {
            settings.slug = slug;
            drop(settings);
            self.save_to_disk().await?;
            Ok((true, previous))
        } else {
            Ok((false, previous))
        }
    }
}
