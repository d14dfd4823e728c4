//! Command handlers for the CLI.

use anyhow::{bail, Context, Result};
use tokio::io::AsyncBufReadExt;

use token_vault::ci::{self, TravisRegistry};
use token_vault::cipher::{CipherError, KeyMaterial};
use token_vault::config::Config;
use token_vault::git;
use token_vault::oauth::{Credential, OAuthApp, OAuthClient, OAuthError, PendingAuthorization};
use token_vault::workflow::{self, Project, Registration};
use token_vault::SettingsStore;

use crate::{OAuthArgs, Preset};

/// Loopback redirect used by the presets; nothing needs to listen on it.
const DEFAULT_REDIRECT_URI: &str = "http://localhost:1410/";

impl Preset {
    fn app(self) -> OAuthApp {
        let (authorize_url, token_url) = match self {
            Preset::Google => (
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
            ),
            Preset::Github => (
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
            ),
        };
        OAuthApp {
            client_id: String::new(),
            client_secret: None,
            authorize_url: authorize_url.to_string(),
            token_url: token_url.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: Vec::new(),
        }
    }
}

/// Merge CLI flags over a preset or the stored application.
fn merge_oauth_app(stored: Option<OAuthApp>, args: &OAuthArgs) -> Result<OAuthApp> {
    let mut app = match (args.preset, stored) {
        (Some(preset), Some(stored)) => OAuthApp {
            client_id: stored.client_id,
            client_secret: stored.client_secret,
            scopes: stored.scopes,
            ..preset.app()
        },
        (Some(preset), None) => preset.app(),
        (None, Some(stored)) => stored,
        (None, None) => OAuthApp {
            client_id: String::new(),
            client_secret: None,
            authorize_url: String::new(),
            token_url: String::new(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: Vec::new(),
        },
    };

    if let Some(v) = &args.client_id {
        app.client_id = v.clone();
    }
    if let Some(v) = &args.client_secret {
        app.client_secret = Some(v.clone());
    }
    if let Some(v) = &args.authorize_url {
        app.authorize_url = v.clone();
    }
    if let Some(v) = &args.token_url {
        app.token_url = v.clone();
    }
    if let Some(v) = &args.redirect_uri {
        app.redirect_uri = v.clone();
    }
    if !args.scopes.is_empty() {
        app.scopes = args.scopes.clone();
    }

    if app.client_id.is_empty() || app.authorize_url.is_empty() || app.token_url.is_empty() {
        return Err(OAuthError::NotConfigured.into());
    }
    Ok(app)
}

/// The app as used at runtime: the env secret wins over the stored one.
fn runtime_app(config: &Config, mut app: OAuthApp) -> OAuthApp {
    if let Some(secret) = &config.client_secret {
        app.client_secret = Some(secret.clone());
    }
    app
}

async fn project(config: &Config, settings: &SettingsStore) -> Project {
    Project::new(config.project_dir.clone(), settings.get().await)
}

/// Run the browser flow and return the new credential without storing it.
async fn acquire(config: &Config, settings: &SettingsStore, args: &OAuthArgs) -> Result<Credential> {
    let current = settings.get().await;
    let app = merge_oauth_app(current.oauth.clone(), args)?;
    if current.oauth.as_ref() != Some(&app) {
        settings
            .set_oauth_app(app.clone())
            .await
            .with_context(|| format!("Failed to save {}", settings.storage_path().display()))?;
    }

    let client = OAuthClient::new(runtime_app(config, app));
    let pending = PendingAuthorization::new();
    let url = client
        .app()
        .authorize_url(&pending.challenge, &pending.state)?;

    println!("Open this URL in your browser and approve access:\n\n  {}\n", url);
    println!("Then paste the URL your browser was redirected to (or the code) and press Enter:");

    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read authorization input")?;

    Ok(client.exchange_code(&pending, &line).await?)
}

pub async fn login(config: &Config, settings: &SettingsStore, args: &OAuthArgs) -> Result<()> {
    let credential = acquire(config, settings, args).await?;
    let project = project(config, settings).await;
    project.token_store().write(&credential).await?;
    println!("Token saved to {}", project.plaintext_rel().display());
    Ok(())
}

pub async fn refresh(config: &Config, settings: &SettingsStore) -> Result<()> {
    let project = project(config, settings).await;
    let app = project
        .settings()
        .oauth
        .clone()
        .ok_or(OAuthError::NotConfigured)?;
    let store = project.token_store();
    let credential = store.read().await?;

    let refreshed = OAuthClient::new(runtime_app(config, app))
        .refresh(&credential)
        .await?;
    store.write(&refreshed).await?;

    println!("Token refreshed; re-run `token-vault encrypt` to update the committed copy.");
    Ok(())
}

pub async fn status(config: &Config, settings: &SettingsStore) -> Result<()> {
    let project = project(config, settings).await;
    let store = project.token_store();
    let state = store.state().await;

    println!("Plaintext:  {}", project.plaintext_rel().display());
    println!("Encrypted:  {}", project.encrypted_rel().display());
    println!("Artifacts:  {}", state);
    println!("CI vars:    ${}_key / ${}_iv", project.env_prefix(), project.env_prefix());

    if state.has_plaintext() {
        match store.read().await {
            Ok(credential) => {
                let expiry = match credential.expires_at {
                    Some(ms) => chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| ms.to_string()),
                    None => "never".to_string(),
                };
                let note = if credential.is_expired() { " (expired)" } else { "" };
                println!("Expires:    {}{}", expiry, note);
                println!(
                    "Refreshable: {}",
                    if credential.refresh_token.is_some() { "yes" } else { "no" }
                );
            }
            Err(e) => println!("Token:      unreadable ({})", e),
        }
    }

    match git::current_branch(&config.project_dir).await {
        Ok(branch) => println!(
            "Branch:     {} ({} packaging)",
            branch,
            project.branch_mode(&branch)
        ),
        Err(e) => println!("Branch:     unknown ({})", e),
    }
    Ok(())
}

pub async fn encrypt(config: &Config, settings: &SettingsStore, dry_run: bool) -> Result<()> {
    let project = project(config, settings).await;

    let outcome = if dry_run {
        workflow::encrypt(&project, None).await?
    } else {
        let resolved = ci::resolve_slug(project.root(), project.settings().slug.as_deref()).await?;
        tracing::info!("Using repository slug {} ({:?})", resolved.slug, resolved.source);
        let registry = TravisRegistry::new(&config.ci.api_url, config.ci.require_token()?);
        workflow::encrypt(
            &project,
            Some(Registration {
                registry: &registry,
                slug: &resolved.slug,
            }),
        )
        .await?
    };

    println!("Encrypted {}", project.encrypted_rel().display());
    match &outcome.registered_with {
        Some(slug) => println!("Registered ${0}_key and ${0}_iv for {1}", outcome.prefix, slug),
        None => {
            println!("Key registration skipped. Set these private CI variables yourself:");
            println!("  {}_key={}", outcome.prefix, outcome.keys.key_hex());
            println!("  {}_iv={}", outcome.prefix, outcome.keys.iv_hex());
        }
    }
    for (changed, path) in [
        (outcome.vcs_ignore_changed, &project.settings().paths.vcs_ignore),
        (outcome.dist_ignore_changed, &project.settings().paths.dist_ignore),
        (outcome.ci_config_changed, &project.settings().paths.ci_config),
    ] {
        if changed {
            println!("Updated {}", path.display());
        }
    }
    println!(
        "Commit {} and the updated files; never commit {}.",
        project.encrypted_rel().display(),
        project.plaintext_rel().display()
    );
    Ok(())
}

pub async fn decrypt(config: &Config, settings: &SettingsStore, allow_missing: bool) -> Result<()> {
    let project = project(config, settings).await;
    let keys = match KeyMaterial::from_env(&project.env_prefix()) {
        Ok(keys) => keys,
        Err(CipherError::MissingEnv(var)) if allow_missing => {
            tracing::warn!("{} is not set; skipping decryption", var);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    workflow::decrypt(&project, &keys).await?;
    println!("Decrypted {}", project.plaintext_rel().display());
    Ok(())
}

pub async fn check(config: &Config, settings: &SettingsStore, json: bool) -> Result<()> {
    let project = project(config, settings).await;
    let branch = match git::current_branch(project.root()).await {
        Ok(branch) => Some(branch),
        Err(e) => {
            tracing::debug!("Could not determine branch: {}", e);
            None
        }
    };
    let report = workflow::check(&project, branch.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for finding in &report.findings {
            let marker = match finding.severity {
                token_vault::check::Severity::Ok => "ok  ",
                token_vault::check::Severity::Warning => "warn",
                token_vault::check::Severity::Error => "FAIL",
            };
            println!("[{}] {}", marker, finding.message);
        }
    }

    if !report.is_ok() {
        bail!("{} layout check(s) failed", report.errors().count());
    }
    Ok(())
}

pub async fn package(
    config: &Config,
    settings: &SettingsStore,
    branch: Option<String>,
) -> Result<()> {
    let project = project(config, settings).await;
    let branch = match branch {
        Some(b) => b,
        None => git::current_branch(project.root()).await?,
    };
    let (mode, changed) = workflow::package(&project, &branch).await?;
    let verb = if mode.bundles_plaintext() { "included in" } else { "excluded from" };
    println!(
        "{} is {} package builds on {} ({} mode){}",
        project.plaintext_rel().display(),
        verb,
        branch,
        mode,
        if changed { "" } else { "; nothing changed" }
    );
    Ok(())
}

pub async fn slug_show(config: &Config, settings: &SettingsStore) -> Result<()> {
    let override_slug = settings.get().await.slug;
    let resolved = ci::resolve_slug(&config.project_dir, override_slug.as_deref()).await?;
    println!("{} (from {:?})", resolved.slug, resolved.source);
    Ok(())
}

pub async fn slug_fix(config: &Config) -> Result<()> {
    let (previous, current) = ci::fix_slug(&config.project_dir).await?;
    match previous {
        Some(prev) if prev == current => println!("Slug already {}", current),
        Some(prev) => println!("Slug updated: {} -> {}", prev, current),
        None => println!("Slug set to {}", current),
    }
    Ok(())
}

pub async fn slug_pin(settings: &SettingsStore, slug: Option<String>) -> Result<()> {
    if let Some(slug) = &slug {
        if !slug.contains('/') || slug.starts_with('/') || slug.ends_with('/') {
            bail!("Expected a slug of the form owner/repo, got {:?}", slug);
        }
    }
    let (changed, previous) = settings
        .set_slug(slug.clone())
        .await
        .with_context(|| format!("Failed to save {}", settings.storage_path().display()))?;
    match (changed, slug) {
        (false, _) => println!("Slug pin unchanged"),
        (true, Some(slug)) => println!("Pinned slug {}", slug),
        (true, None) => println!(
            "Unpinned slug {}",
            previous.unwrap_or_default()
        ),
    }
    Ok(())
}

pub async fn rotate(
    config: &Config,
    settings: &SettingsStore,
    args: &OAuthArgs,
    dry_run: bool,
) -> Result<()> {
    let credential = acquire(config, settings, args).await?;
    let project = project(config, settings).await;
    workflow::replace_credential(&project, &credential).await?;
    println!(
        "Replaced {} and discarded the old ciphertext. Revoke the old token with the provider if it is still listed.",
        project.plaintext_rel().display()
    );

    encrypt(config, settings, dry_run).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> OAuthArgs {
        OAuthArgs {
            preset: None,
            client_id: None,
            client_secret: None,
            authorize_url: None,
            token_url: None,
            redirect_uri: None,
            scopes: Vec::new(),
        }
    }

    #[test]
    fn preset_plus_client_id_is_complete() {
        let app = merge_oauth_app(
            None,
            &OAuthArgs {
                preset: Some(Preset::Google),
                client_id: Some("abc.apps.googleusercontent.com".to_string()),
                scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
                ..args()
            },
        )
        .unwrap();
        assert_eq!(app.token_url, "https://oauth2.googleapis.com/token");
        assert_eq!(app.redirect_uri, DEFAULT_REDIRECT_URI);
        assert_eq!(app.scopes.len(), 1);
    }

    #[test]
    fn stored_app_is_reused_and_flags_override() {
        let stored = merge_oauth_app(
            None,
            &OAuthArgs {
                preset: Some(Preset::Github),
                client_id: Some("id".to_string()),
                ..args()
            },
        )
        .unwrap();

        let reused = merge_oauth_app(Some(stored.clone()), &args()).unwrap();
        assert_eq!(reused, stored);

        let overridden = merge_oauth_app(
            Some(stored),
            &OAuthArgs {
                client_id: Some("other".to_string()),
                ..args()
            },
        )
        .unwrap();
        assert_eq!(overridden.client_id, "other");
        assert_eq!(overridden.token_url, "https://github.com/login/oauth/access_token");
    }

    #[test]
    fn incomplete_app_is_not_configured() {
        let err = merge_oauth_app(None, &args()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OAuthError>(),
            Some(OAuthError::NotConfigured)
        ));
    }

    #[test]
    fn env_secret_overrides_stored_secret() {
        let mut config = Config::new(std::path::PathBuf::from("."));
        config.client_secret = Some("from-env".to_string());
        let app = runtime_app(
            &config,
            OAuthApp {
                client_secret: Some("stored".to_string()),
                ..Preset::Google.app()
            },
        );
        assert_eq!(app.client_secret.as_deref(), Some("from-env"));
    }
}
