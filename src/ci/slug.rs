//! Repository slug resolution.
//!
//! The CI provider keys encryption registrations by `owner/repo`. Its CLI
//! caches that slug in local git config; after a rename or transfer the
//! cached value goes stale and every registration is rejected. A cached slug
//! that disagrees with the `origin` remote therefore blocks encryption until
//! `slug fix` rewrites it.

use std::path::Path;

use thiserror::Error;

use crate::git::{self, GitError, SLUG_CONFIG_KEY};

#[derive(Debug, Error)]
pub enum SlugError {
    #[error(
        "Cached repository slug {cached:?} does not match origin {remote:?}. \
         Run `token-vault slug fix` (or `git config {key} {remote}`) and retry.",
        key = SLUG_CONFIG_KEY
    )]
    Mismatch { cached: String, remote: String },

    #[error("Cannot determine the repository slug: no {key} in git config and no usable origin remote", key = SLUG_CONFIG_KEY)]
    Unknown,

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Where the resolved slug came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlugSource {
    Settings,
    GitConfig,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlug {
    pub slug: String,
    pub source: SlugSource,
}

/// Derive `owner/repo` from a remote URL.
///
/// Handles `https://host/owner/repo(.git)`, `ssh://git@host/owner/repo.git`
/// and scp-style `git@host:owner/repo.git`.
pub fn parse_slug_from_remote(remote: &str) -> Option<String> {
    let remote = remote.trim();
    let path = if let Ok(url) = url::Url::parse(remote) {
        url.path().to_string()
    } else {
        // scp-like syntax: user@host:path
        let (_, path) = remote.split_once(':')?;
        path.to_string()
    };

    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut segments = path.rsplit('/');
    let repo = segments.next().filter(|s| !s.is_empty())?;
    let owner = segments.next().filter(|s| !s.is_empty())?;
    Some(format!("{}/{}", owner, repo))
}

/// Pick a slug from the candidate sources.
///
/// A settings override always wins. Otherwise a cached slug and the remote
/// must agree (case-insensitively, as hosting providers treat them).
pub fn choose_slug(
    override_slug: Option<&str>,
    cached: Option<&str>,
    remote: Option<&str>,
) -> Result<ResolvedSlug, SlugError> {
    if let Some(slug) = override_slug {
        return Ok(ResolvedSlug {
            slug: slug.to_string(),
            source: SlugSource::Settings,
        });
    }

    match (cached, remote) {
        (Some(cached), Some(remote)) if !cached.eq_ignore_ascii_case(remote) => {
            Err(SlugError::Mismatch {
                cached: cached.to_string(),
                remote: remote.to_string(),
            })
        }
        (Some(cached), _) => Ok(ResolvedSlug {
            slug: cached.to_string(),
            source: SlugSource::GitConfig,
        }),
        (None, Some(remote)) => Ok(ResolvedSlug {
            slug: remote.to_string(),
            source: SlugSource::Remote,
        }),
        (None, None) => Err(SlugError::Unknown),
    }
}

async fn remote_slug(repo: &Path) -> Result<Option<String>, SlugError> {
    Ok(git::remote_url(repo, "origin")
        .await?
        .as_deref()
        .and_then(parse_slug_from_remote))
}

/// Resolve the slug for the repository at `repo`.
pub async fn resolve_slug(
    repo: &Path,
    override_slug: Option<&str>,
) -> Result<ResolvedSlug, SlugError> {
    if override_slug.is_some() {
        return choose_slug(override_slug, None, None);
    }
    let cached = git::config_get(repo, SLUG_CONFIG_KEY).await?;
    let remote = remote_slug(repo).await?;
    choose_slug(None, cached.as_deref(), remote.as_deref())
}

/// Rewrite the cached slug to the one derived from `origin`.
///
/// Returns `(previous, current)`.
pub async fn fix_slug(repo: &Path) -> Result<(Option<String>, String), SlugError> {
    let remote = remote_slug(repo).await?.ok_or(SlugError::Unknown)?;
    let previous = git::config_get(repo, SLUG_CONFIG_KEY).await?;
    if previous.as_deref() != Some(remote.as_str()) {
        git::config_set(repo, SLUG_CONFIG_KEY, &remote).await?;
        tracing::info!(
            "Updated {} from {:?} to {}",
            SLUG_CONFIG_KEY,
            previous,
            remote
        );
    }
    Ok((previous, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_remote_forms() {
        for remote in [
            "https://github.com/octo/widgets.git",
            "https://github.com/octo/widgets",
            "https://github.com/octo/widgets/",
            "git@github.com:octo/widgets.git",
            "ssh://git@github.com/octo/widgets.git",
            "https://user:pw@gitlab.example.com:8443/octo/widgets.git",
        ] {
            assert_eq!(
                parse_slug_from_remote(remote).as_deref(),
                Some("octo/widgets"),
                "{remote}"
            );
        }
    }

    #[test]
    fn rejects_remotes_without_owner() {
        assert_eq!(parse_slug_from_remote("https://github.com/widgets"), None);
        assert_eq!(parse_slug_from_remote("/srv/git/widgets"), None);
        assert_eq!(parse_slug_from_remote(""), None);
    }

    #[test]
    fn stale_cached_slug_is_a_mismatch() {
        let err = choose_slug(None, Some("old-owner/widgets"), Some("octo/widgets")).unwrap_err();
        match &err {
            SlugError::Mismatch { cached, remote } => {
                assert_eq!(cached, "old-owner/widgets");
                assert_eq!(remote, "octo/widgets");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(err.to_string().contains("slug fix"));
    }

    #[test]
    fn agreeing_sources_resolve() {
        let r = choose_slug(None, Some("Octo/Widgets"), Some("octo/widgets")).unwrap();
        assert_eq!(r.source, SlugSource::GitConfig);
        assert_eq!(r.slug, "Octo/Widgets");

        let r = choose_slug(None, None, Some("octo/widgets")).unwrap();
        assert_eq!(r.source, SlugSource::Remote);

        let r = choose_slug(None, Some("octo/widgets"), None).unwrap();
        assert_eq!(r.source, SlugSource::GitConfig);
    }

    #[test]
    fn override_wins_and_nothing_is_unknown() {
        let r = choose_slug(Some("me/mine"), Some("a/b"), Some("c/d")).unwrap();
        assert_eq!(r, ResolvedSlug { slug: "me/mine".to_string(), source: SlugSource::Settings });
        assert!(matches!(choose_slug(None, None, None), Err(SlugError::Unknown)));
    }
}
