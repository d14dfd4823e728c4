//! Git metadata queries.
//!
//! Everything goes through the `git` binary run in the project directory:
//! the current branch (for the packaging filter), the `origin` remote URL and
//! the `travis.slug` key that the CI CLI caches in `.git/config`.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// Local git config key holding the CI provider's cached repository slug.
pub const SLUG_CONFIG_KEY: &str = "travis.slug";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Command(String),

    #[error("HEAD is detached; check out a branch first")]
    DetachedHead,
}

/// Name of the checked-out branch.
pub async fn current_branch(repo: &Path) -> Result<String, GitError> {
    let out = run_git_command(&["rev-parse", "--abbrev-ref", "HEAD"], repo).await?;
    let branch = out.trim().to_string();
    if branch == "HEAD" {
        return Err(GitError::DetachedHead);
    }
    Ok(branch)
}

/// URL of the named remote, or `None` when it is not configured.
pub async fn remote_url(repo: &Path, remote: &str) -> Result<Option<String>, GitError> {
    config_get(repo, &format!("remote.{}.url", remote)).await
}

/// Read a local git config value; `None` if unset.
pub async fn config_get(repo: &Path, key: &str) -> Result<Option<String>, GitError> {
    let output = git(&["config", "--local", "--get", key], repo).await?;
    // `git config --get` exits 1 for a missing key.
    match output.status.code() {
        Some(0) => {
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(value).filter(|v| !v.is_empty()))
        }
        Some(1) => Ok(None),
        _ => Err(command_error(&output)),
    }
}

/// Write a local git config value.
pub async fn config_set(repo: &Path, key: &str, value: &str) -> Result<(), GitError> {
    run_git_command(&["config", "--local", key, value], repo).await?;
    Ok(())
}

async fn git(args: &[&str], repo: &Path) -> Result<std::process::Output, GitError> {
    tracing::debug!("git {}", args.join(" "));
    Ok(Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?)
}

fn command_error(output: &std::process::Output) -> GitError {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        GitError::Command(format!("command failed: {}", stdout.trim()))
    } else {
        GitError::Command(stderr.trim().to_string())
    }
}

/// Run a git command and return its stdout.
async fn run_git_command(args: &[&str], repo: &Path) -> Result<String, GitError> {
    let output = git(args, repo).await?;
    if !output.status.success() {
        return Err(command_error(&output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> Option<tempfile::TempDir> {
        let dir = tempfile::tempdir().unwrap();
        match run_git_command(&["init", "-q"], dir.path()).await {
            Ok(_) => Some(dir),
            Err(e) => {
                eprintln!("skipping: git unavailable ({})", e);
                None
            }
        }
    }

    #[tokio::test]
    async fn config_round_trip_and_missing_keys() {
        let Some(dir) = init_repo().await else { return };
        let repo = dir.path();

        assert_eq!(config_get(repo, SLUG_CONFIG_KEY).await.unwrap(), None);
        assert_eq!(remote_url(repo, "origin").await.unwrap(), None);

        config_set(repo, SLUG_CONFIG_KEY, "octo/widgets").await.unwrap();
        assert_eq!(
            config_get(repo, SLUG_CONFIG_KEY).await.unwrap().as_deref(),
            Some("octo/widgets")
        );

        run_git_command(
            &["remote", "add", "origin", "git@github.com:octo/widgets.git"],
            repo,
        )
        .await
        .unwrap();
        assert_eq!(
            remote_url(repo, "origin").await.unwrap().as_deref(),
            Some("git@github.com:octo/widgets.git")
        );
    }
}
