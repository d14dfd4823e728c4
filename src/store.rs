//! Credential persistence.
//!
//! The plaintext credential is written as pretty JSON at a fixed,
//! project-relative path. Writes take an exclusive `fs2` lock so a `login`
//! and a `refresh` started from two terminals cannot interleave. `fs2` locks
//! are blocking, so the locked write runs on the blocking pool.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use thiserror::Error;

use crate::oauth::Credential;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No credential at {0}; run `token-vault login` first")]
    NotFound(PathBuf),

    #[error("Credential at {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Which at-rest forms of the credential exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Missing,
    PlaintextOnly,
    EncryptedOnly,
    Both,
}

impl ArtifactState {
    pub fn has_plaintext(self) -> bool {
        matches!(self, Self::PlaintextOnly | Self::Both)
    }

    pub fn has_encrypted(self) -> bool {
        matches!(self, Self::EncryptedOnly | Self::Both)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::PlaintextOnly => "plaintext only",
            Self::EncryptedOnly => "encrypted only",
            Self::Both => "plaintext and encrypted",
        };
        f.write_str(s)
    }
}

/// Reads and writes the credential files.
#[derive(Debug, Clone)]
pub struct TokenStore {
    plaintext: PathBuf,
    encrypted: PathBuf,
}

impl TokenStore {
    /// Both paths are absolute (already resolved against the project root).
    pub fn new(plaintext: PathBuf, encrypted: PathBuf) -> Self {
        Self {
            plaintext,
            encrypted,
        }
    }

    pub fn plaintext_path(&self) -> &Path {
        &self.plaintext
    }

    pub fn encrypted_path(&self) -> &Path {
        &self.encrypted
    }

    /// Serialize `credential` to the plaintext path.
    pub async fn write(&self, credential: &Credential) -> Result<(), StoreError> {
        let contents =
            serde_json::to_vec_pretty(credential).map_err(|source| StoreError::Parse {
                path: self.plaintext.clone(),
                source,
            })?;

        let path = self.plaintext.clone();
        tokio::task::spawn_blocking(move || write_locked(&path, &contents))
            .await
            .map_err(|e| StoreError::Io {
                path: self.plaintext.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })??;

        tracing::info!("Wrote credential to {}", self.plaintext.display());
        Ok(())
    }

    /// Load the plaintext credential.
    pub async fn read(&self) -> Result<Credential, StoreError> {
        let path = &self.plaintext;
        let contents = match tokio::fs::read(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.clone()))
            }
            Err(e) => return Err(io_err(path)(e)),
        };
        serde_json::from_slice(&contents).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Delete the plaintext file, and the encrypted file too when
    /// `include_encrypted` is set. Missing files are not an error.
    pub async fn remove(&self, include_encrypted: bool) -> Result<(), StoreError> {
        remove_if_exists(&self.plaintext).await?;
        if include_encrypted {
            remove_if_exists(&self.encrypted).await?;
        }
        Ok(())
    }

    pub async fn state(&self) -> ArtifactState {
        match (is_file(&self.plaintext).await, is_file(&self.encrypted).await) {
            (false, false) => ArtifactState::Missing,
            (true, false) => ArtifactState::PlaintextOnly,
            (false, true) => ArtifactState::EncryptedOnly,
            (true, true) => ArtifactState::Both,
        }
    }
}

fn write_locked(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_err(path))?;
    file.lock_exclusive().map_err(io_err(path))?;

    let result = file
        .set_len(0)
        .and_then(|_| file.write_all(contents))
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all());
    let unlock = FileExt::unlock(&file);
    result.map_err(io_err(path))?;
    unlock.map_err(io_err(path))?;
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::info!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(token: &str) -> Credential {
        Credential {
            access_token: token.to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: "Bearer".to_string(),
            scope: None,
            expires_at: Some(42),
            obtained_at: 1,
        }
    }

    fn store(dir: &Path) -> TokenStore {
        let plain = dir.join("tests/testthat/token.json");
        TokenStore::new(plain.clone(), crate::util::with_suffix(&plain, ".enc"))
    }

    #[tokio::test]
    async fn write_creates_parents_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.state().await, ArtifactState::Missing);

        store.write(&credential("first")).await.unwrap();
        assert_eq!(store.read().await.unwrap(), credential("first"));
        assert_eq!(store.state().await, ArtifactState::PlaintextOnly);
    }

    #[tokio::test]
    async fn shorter_rewrite_truncates_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(&credential(&"x".repeat(500))).await.unwrap();
        store.write(&credential("y")).await.unwrap();
        assert_eq!(store.read().await.unwrap().access_token, "y");
    }

    #[tokio::test]
    async fn read_missing_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(store(dir.path()).read().await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_respects_encrypted_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(&credential("t")).await.unwrap();
        std::fs::write(store.encrypted_path(), b"cipher").unwrap();
        assert_eq!(store.state().await, ArtifactState::Both);

        store.remove(false).await.unwrap();
        assert_eq!(store.state().await, ArtifactState::EncryptedOnly);

        store.remove(true).await.unwrap();
        assert_eq!(store.state().await, ArtifactState::Missing);
        // Removing again is a no-op.
        store.remove(true).await.unwrap();
    }
}
