//! End-to-end operations over one project.
//!
//! Each operation is a sequential, one-shot step: encrypt the token and wire
//! it into CI, decrypt it on the CI machine, toggle packaging for the current
//! branch, check the layout, or discard everything for a rotation.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::check::{check_layout, CheckError, Layout, Report};
use crate::ci::{CiConfig, CiConfigError, DecryptStep, KeyRegistry, RegistryError};
use crate::cipher::{self, env_prefix, iv_var_name, key_var_name, CipherError, KeyMaterial};
use crate::manifest::{IgnoreList, IgnoreSyntax, ManifestError};
use crate::packaging::{apply_branch_mode, BranchMode};
use crate::oauth::Credential;
use crate::settings::Settings;
use crate::store::{StoreError, TokenStore};
use crate::util::{resolve_in, slash_path};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    CiConfig(#[from] CiConfigError),
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error("{0}")]
    Routing(String),
}

/// A project root plus its settings.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    settings: Settings,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Plaintext token path relative to the root.
    pub fn plaintext_rel(&self) -> &Path {
        &self.settings.paths.token
    }

    /// Encrypted token path relative to the root.
    pub fn encrypted_rel(&self) -> PathBuf {
        self.settings.paths.encrypted()
    }

    /// Env-var prefix of the encrypted artifact.
    pub fn env_prefix(&self) -> String {
        env_prefix(&self.encrypted_rel())
    }

    pub fn token_store(&self) -> TokenStore {
        TokenStore::new(
            resolve_in(&self.root, self.plaintext_rel()),
            resolve_in(&self.root, &self.encrypted_rel()),
        )
    }

    pub async fn vcs_ignore(&self) -> Result<IgnoreList, ManifestError> {
        IgnoreList::load(
            resolve_in(&self.root, &self.settings.paths.vcs_ignore),
            IgnoreSyntax::Glob,
        )
        .await
    }

    pub async fn dist_ignore(&self) -> Result<IgnoreList, ManifestError> {
        IgnoreList::load(
            resolve_in(&self.root, &self.settings.paths.dist_ignore),
            IgnoreSyntax::AnchoredRegex,
        )
        .await
    }

    pub async fn ci_config(&self) -> Result<CiConfig, CiConfigError> {
        CiConfig::load(resolve_in(&self.root, &self.settings.paths.ci_config)).await
    }

    pub fn branch_mode(&self, branch: &str) -> BranchMode {
        BranchMode::for_branch(branch, &self.settings.submission_branches)
    }
}

/// Where to register the key and IV.
pub struct Registration<'a> {
    pub registry: &'a dyn KeyRegistry,
    pub slug: &'a str,
}

/// What `encrypt` did.
#[derive(Debug)]
pub struct EncryptOutcome {
    pub prefix: String,
    pub keys: KeyMaterial,
    pub registered_with: Option<String>,
    pub vcs_ignore_changed: bool,
    pub dist_ignore_changed: bool,
    pub ci_config_changed: bool,
}

/// Encrypt the plaintext token and wire the result into the build manifests.
///
/// Manifest edits are computed and checked in memory first, then the CI
/// provider is queried read-only, then the key and IV are registered, and
/// only then is anything written. A stale slug, a bad API token or an ignore
/// rule that would hide the ciphertext from git therefore leaves the tree
/// untouched. A failure between the two registrations is reported as
/// `RegistryError::Inconsistent`.
pub async fn encrypt(
    project: &Project,
    registration: Option<Registration<'_>>,
) -> Result<EncryptOutcome, WorkflowError> {
    let store = project.token_store();
    let plaintext = tokio::fs::read(store.plaintext_path())
        .await
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(store.plaintext_path().to_path_buf()),
            _ => StoreError::Io {
                path: store.plaintext_path().to_path_buf(),
                source,
            },
        })?;

    let plaintext_rel = project.plaintext_rel();
    let encrypted_rel = project.encrypted_rel();
    let prefix = project.env_prefix();

    let mut vcs = project.vcs_ignore().await?;
    let mut vcs_ignore_changed = vcs.ensure(plaintext_rel)?;
    vcs_ignore_changed |= vcs.unignore(&encrypted_rel)?;

    let mut dist = project.dist_ignore().await?;
    let dist_ignore_changed = dist.ensure(&encrypted_rel)?;

    verify_routing(&vcs, &dist, plaintext_rel, &encrypted_rel)?;

    let mut ci = project.ci_config().await?;
    let step = DecryptStep::new(prefix.clone(), &encrypted_rel, plaintext_rel);
    let ci_config_changed = ci.ensure_decrypt_step(&step)?;

    let keys = KeyMaterial::generate();
    let ciphertext = cipher::encrypt(&keys, &plaintext);

    let registered_with = match registration {
        Some(Registration { registry, slug }) => {
            registry.verify(slug).await?;
            let key_name = key_var_name(&prefix);
            let iv_name = iv_var_name(&prefix);
            registry.register(slug, &key_name, &keys.key_hex()).await?;
            registry
                .register(slug, &iv_name, &keys.iv_hex())
                .await
                .map_err(|source| RegistryError::Inconsistent {
                    slug: slug.to_string(),
                    registered: key_name,
                    missing: iv_name,
                    source: Box::new(source),
                })?;
            tracing::info!("Registered {} key and IV with {}", prefix, slug);
            Some(slug.to_string())
        }
        None => {
            tracing::warn!("Skipping key registration; CI will not be able to decrypt");
            None
        }
    };

    let encrypted_path = store.encrypted_path();
    if let Some(parent) = encrypted_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(encrypted_path, &ciphertext)
        .await
        .map_err(|source| StoreError::Io {
            path: encrypted_path.to_path_buf(),
            source,
        })?;
    tracing::info!("Wrote {}", encrypted_path.display());

    vcs.save().await?;
    dist.save().await?;
    ci.save().await?;

    Ok(EncryptOutcome {
        prefix,
        keys,
        registered_with,
        vcs_ignore_changed,
        dist_ignore_changed,
        ci_config_changed,
    })
}

/// P must be hidden from git, E visible to git and kept out of packages.
fn verify_routing(
    vcs: &IgnoreList,
    dist: &IgnoreList,
    plaintext: &Path,
    encrypted: &Path,
) -> Result<(), WorkflowError> {
    if !vcs.contains(plaintext)? {
        return Err(WorkflowError::Routing(format!(
            "{} would still be committed; {} does not ignore it",
            slash_path(plaintext),
            vcs.path().display()
        )));
    }
    let rules = vcs.excluding_rules(encrypted)?;
    if !rules.is_empty() {
        return Err(ManifestError::Blocked {
            path: vcs.path().to_path_buf(),
            artifact: slash_path(encrypted),
            rules,
        }
        .into());
    }
    if !dist.contains(encrypted)? {
        return Err(WorkflowError::Routing(format!(
            "{} would ship in package builds; {} does not exclude it",
            slash_path(encrypted),
            dist.path().display()
        )));
    }
    Ok(())
}

/// Decrypt the committed token in place, as the CI job does before tests.
pub async fn decrypt(project: &Project, keys: &KeyMaterial) -> Result<(), WorkflowError> {
    let store = project.token_store();
    cipher::decrypt_file(keys, store.encrypted_path(), store.plaintext_path()).await?;
    Ok(())
}

/// Bring the distribution ignore list in line with `branch`.
///
/// Returns the mode applied and whether the list changed.
pub async fn package(project: &Project, branch: &str) -> Result<(BranchMode, bool), WorkflowError> {
    let mode = project.branch_mode(branch);
    let mut dist = project.dist_ignore().await?;
    let changed = apply_branch_mode(&mut dist, project.plaintext_rel(), mode)?;
    dist.save().await?;
    tracing::info!("Applied {} packaging mode for branch {}", mode, branch);
    Ok((mode, changed))
}

/// Check the layout; `branch` is `None` when it could not be determined.
pub async fn check(project: &Project, branch: Option<&str>) -> Result<Report, WorkflowError> {
    let vcs = project.vcs_ignore().await?;
    let dist = project.dist_ignore().await?;
    let ci = project.ci_config().await?;
    let encrypted_rel = project.encrypted_rel();

    Ok(check_layout(&Layout {
        plaintext: project.plaintext_rel(),
        encrypted: &encrypted_rel,
        vcs_ignore: &vcs,
        dist_ignore: &dist,
        ci_config: &ci,
        mode: branch.map(|b| project.branch_mode(b)),
        artifacts: project.token_store().state().await,
    })?)
}

/// Discard both local artifacts.
pub async fn discard(project: &Project) -> Result<(), WorkflowError> {
    project.token_store().remove(true).await?;
    Ok(())
}

/// Swap in a freshly acquired credential for a rotation: the old plaintext
/// and its now-stale ciphertext are discarded, then `credential` is written.
pub async fn replace_credential(
    project: &Project,
    credential: &Credential,
) -> Result<(), WorkflowError> {
    discard(project).await?;
    project.token_store().write(credential).await?;
    Ok(())
}
