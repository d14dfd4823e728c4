//! Ignore-list editing.
//!
//! Two ignore lists decide where the credential artifacts travel:
//! the version-control list (gitignore syntax) keeps the plaintext token out
//! of the repository, and the distribution list (one anchored regex per line,
//! as in `.Rbuildignore`) keeps the encrypted token out of package builds.
//! Edits are "append if missing"; comments, blank lines and unrelated
//! entries are preserved as-is.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use thiserror::Error;

use crate::util::slash_path;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern {pattern:?} in {path}: {source}")]
    Pattern {
        path: PathBuf,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid glob {pattern:?} in {path}: {source}")]
    Glob {
        path: PathBuf,
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("{artifact} is still excluded by {path} ({}); remove or narrow those rules", .rules.join(", "))]
    Blocked {
        path: PathBuf,
        artifact: String,
        rules: Vec<String>,
    },
}

/// How an ignore list's lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreSyntax {
    /// gitignore: literal paths, `*` and `**` wildcards, `!` negation.
    Glob,
    /// Each line is a case-insensitive regex matched against the relative path.
    AnchoredRegex,
}

/// An ignore list loaded into memory.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    path: PathBuf,
    syntax: IgnoreSyntax,
    lines: Vec<String>,
    dirty: bool,
}

impl IgnoreList {
    /// Load the list at `path`. A missing file is an empty list.
    pub async fn load(path: impl Into<PathBuf>, syntax: IgnoreSyntax) -> Result<Self, ManifestError> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        Ok(Self::parse(path, syntax, &contents))
    }

    pub fn parse(path: impl Into<PathBuf>, syntax: IgnoreSyntax, contents: &str) -> Self {
        Self {
            path: path.into(),
            syntax,
            lines: contents.lines().map(str::to_string).collect(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn syntax(&self) -> IgnoreSyntax {
        self.syntax
    }

    /// Whether an edit is pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Canonical entry for `artifact` in this list's syntax.
    pub fn entry_for(&self, artifact: &Path) -> String {
        let rel = slash_path(artifact);
        match self.syntax {
            IgnoreSyntax::Glob => rel,
            IgnoreSyntax::AnchoredRegex => format!("^{}$", regex::escape(&rel)),
        }
    }

    fn rules(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
    }

    /// Whether any rule in the list excludes `artifact`.
    pub fn contains(&self, artifact: &Path) -> Result<bool, ManifestError> {
        Ok(!self.excluding_rules(artifact)?.is_empty())
    }

    /// The rules that exclude `artifact`; empty when it is not excluded.
    ///
    /// For gitignore syntax this is the single deciding rule: an excluded
    /// ancestor directory wins over anything below it, otherwise the last
    /// matching rule decides.
    pub fn excluding_rules(&self, artifact: &Path) -> Result<Vec<String>, ManifestError> {
        let rel = slash_path(artifact);
        match self.syntax {
            IgnoreSyntax::Glob => {
                let rules = self.glob_rules()?;
                Ok(glob_exclusion(&rules, &rel)
                    .map(|r| vec![r.line.clone()])
                    .unwrap_or_default())
            }
            IgnoreSyntax::AnchoredRegex => {
                let mut matching = Vec::new();
                for rule in self.rules() {
                    let re = Regex::new(&format!("(?i){}", rule)).map_err(|source| {
                        ManifestError::Pattern {
                            path: self.path.clone(),
                            pattern: rule.to_string(),
                            source,
                        }
                    })?;
                    if re.is_match(&rel) {
                        matching.push(rule.to_string());
                    }
                }
                Ok(matching)
            }
        }
    }

    fn glob_rules(&self) -> Result<Vec<GlobRule>, ManifestError> {
        self.rules()
            .map(|line| {
                GlobRule::parse(line).map_err(|source| ManifestError::Glob {
                    path: self.path.clone(),
                    pattern: line.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// Append the canonical entry for `artifact` unless something already
    /// excludes it. Returns whether the list changed.
    pub fn ensure(&mut self, artifact: &Path) -> Result<bool, ManifestError> {
        if self.contains(artifact)? {
            return Ok(false);
        }
        let entry = self.entry_for(artifact);
        tracing::info!("Adding {} to {}", entry, self.path.display());
        self.lines.push(entry);
        self.dirty = true;
        Ok(true)
    }

    /// Remove every line equal to the canonical entry for `artifact`.
    /// Returns whether the list changed.
    pub fn remove(&mut self, artifact: &Path) -> bool {
        let entry = self.entry_for(artifact);
        let before = self.lines.len();
        self.lines.retain(|l| l.trim() != entry);
        let changed = self.lines.len() != before;
        if changed {
            tracing::info!("Removed {} from {}", entry, self.path.display());
            self.dirty = true;
        }
        changed
    }

    /// Make sure nothing in the list excludes `artifact`.
    ///
    /// Drops the canonical entry; if a broader gitignore rule still matches,
    /// appends a `!` re-include. Fails with `Blocked` when the artifact stays
    /// excluded (an excluded parent directory, or a regex list, which has no
    /// negation). Returns whether the list changed.
    pub fn unignore(&mut self, artifact: &Path) -> Result<bool, ManifestError> {
        let mut changed = self.remove(artifact);
        if !self.contains(artifact)? {
            return Ok(changed);
        }

        if self.syntax == IgnoreSyntax::Glob {
            let negation = format!("!{}", self.entry_for(artifact));
            tracing::info!("Adding {} to {}", negation, self.path.display());
            self.lines.push(negation);
            self.dirty = true;
            changed = true;
        }

        let rules = self.excluding_rules(artifact)?;
        if rules.is_empty() {
            return Ok(changed);
        }
        Err(ManifestError::Blocked {
            path: self.path.clone(),
            artifact: slash_path(artifact),
            rules,
        })
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Write the list back if it changed.
    pub async fn save(&mut self) -> Result<(), ManifestError> {
        if !self.dirty {
            return Ok(());
        }
        tokio::fs::write(&self.path, self.render())
            .await
            .map_err(|source| ManifestError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.dirty = false;
        Ok(())
    }
}

/// One compiled gitignore line.
#[derive(Debug)]
struct GlobRule {
    line: String,
    negated: bool,
    dir_only: bool,
    matcher: GlobMatcher,
}

impl GlobRule {
    fn parse(line: &str) -> Result<Self, globset::Error> {
        let (negated, pattern) = match line.strip_prefix('!') {
            Some(p) => (true, p),
            None => (false, line),
        };
        let dir_only = pattern.ends_with('/');
        let pattern = pattern.trim_end_matches('/');
        // A slash anywhere but the end anchors the rule to the list's directory.
        let anchored = pattern.contains('/');
        let pattern = pattern.trim_start_matches('/');
        let glob = if anchored || pattern.starts_with("**/") {
            pattern.to_string()
        } else {
            format!("**/{}", pattern)
        };

        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        Ok(Self {
            line: line.to_string(),
            negated,
            dir_only,
            matcher,
        })
    }

    fn applies(&self, candidate: &str, is_dir: bool) -> bool {
        (is_dir || !self.dir_only) && self.matcher.is_match(candidate)
    }
}

fn last_match<'a>(rules: &'a [GlobRule], candidate: &str, is_dir: bool) -> Option<&'a GlobRule> {
    rules.iter().rev().find(|r| r.applies(candidate, is_dir))
}

/// The rule excluding `rel`, if any. Git never descends into an excluded
/// directory, so a `!` rule cannot re-include a file below one.
fn glob_exclusion<'a>(rules: &'a [GlobRule], rel: &str) -> Option<&'a GlobRule> {
    let parts: Vec<&str> = rel.split('/').collect();
    for depth in 1..parts.len() {
        let dir = parts[..depth].join("/");
        if let Some(rule) = last_match(rules, &dir, true) {
            if !rule.negated {
                return Some(rule);
            }
        }
    }
    last_match(rules, rel, false).filter(|r| !r.negated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "tests/testthat/token.json";
    const TOKEN_ENC: &str = "tests/testthat/token.json.enc";

    fn gitignore(contents: &str) -> IgnoreList {
        IgnoreList::parse(".gitignore", IgnoreSyntax::Glob, contents)
    }

    fn buildignore(contents: &str) -> IgnoreList {
        IgnoreList::parse(".Rbuildignore", IgnoreSyntax::AnchoredRegex, contents)
    }

    #[test]
    fn entries_are_rendered_per_syntax() {
        assert_eq!(gitignore("").entry_for(Path::new(TOKEN)), TOKEN);
        assert_eq!(
            buildignore("").entry_for(Path::new(TOKEN_ENC)),
            r"^tests/testthat/token\.json\.enc$"
        );
    }

    #[test]
    fn regex_entry_does_not_match_sibling_file() {
        let list = buildignore(r"^tests/testthat/token\.json\.enc$");
        assert!(list.contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(!list.contains(Path::new(TOKEN)).unwrap());
    }

    #[test]
    fn unanchored_regex_lines_match_anywhere() {
        let list = buildignore("^.*\\.Rproj$\n\\.enc$\n");
        assert!(list.contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(!list.contains(Path::new(TOKEN)).unwrap());
    }

    #[test]
    fn invalid_regex_is_reported() {
        let list = buildignore("^tests/(unclosed$");
        assert!(matches!(
            list.contains(Path::new(TOKEN)),
            Err(ManifestError::Pattern { .. })
        ));
    }

    #[test]
    fn glob_rules_follow_gitignore_semantics() {
        assert!(gitignore("token.json").contains(Path::new(TOKEN)).unwrap());
        assert!(gitignore("/tests/testthat/token.json").contains(Path::new(TOKEN)).unwrap());
        assert!(gitignore("tests/").contains(Path::new(TOKEN)).unwrap());
        assert!(gitignore("*.json").contains(Path::new(TOKEN)).unwrap());
        assert!(!gitignore("*.json").contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(gitignore("tests/**/token.*").contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(!gitignore("/token.json").contains(Path::new(TOKEN)).unwrap());
        assert!(!gitignore("*.json\n!tests/testthat/token.json").contains(Path::new(TOKEN)).unwrap());
    }

    #[test]
    fn excluded_parent_directory_cannot_be_reincluded() {
        let list = gitignore("tests/\n!tests/testthat/token.json.enc\n");
        assert!(list.contains(Path::new(TOKEN_ENC)).unwrap());
        assert_eq!(list.excluding_rules(Path::new(TOKEN_ENC)).unwrap(), vec!["tests/"]);

        let list = gitignore("tests/*\n!tests/testthat/\ntests/testthat/*\n!tests/testthat/token.json.enc\n");
        assert!(!list.contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(list.contains(Path::new(TOKEN)).unwrap());
    }

    #[test]
    fn leading_double_star_matches_at_the_root() {
        assert!(gitignore("**/token.json").contains(Path::new("token.json")).unwrap());
        assert!(gitignore("**/token.json").contains(Path::new(TOKEN)).unwrap());
        assert!(!gitignore("tests/*.json").contains(Path::new(TOKEN)).unwrap());
    }

    #[test]
    fn unignore_negates_a_broader_rule() {
        let mut list = gitignore("tests/testthat/token.json*\n");
        assert!(list.unignore(Path::new(TOKEN_ENC)).unwrap());
        assert!(!list.contains(Path::new(TOKEN_ENC)).unwrap());
        assert!(list.contains(Path::new(TOKEN)).unwrap());
        assert_eq!(
            list.render(),
            "tests/testthat/token.json*\n!tests/testthat/token.json.enc\n"
        );
    }

    #[test]
    fn unignore_reports_blocking_rules() {
        let mut list = gitignore("tests/\n");
        match list.unignore(Path::new(TOKEN_ENC)) {
            Err(ManifestError::Blocked { rules, .. }) => assert_eq!(rules, vec!["tests/"]),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut list = buildignore("^tests/testthat/token\\.json.*$\n");
        match list.unignore(Path::new(TOKEN)) {
            Err(ManifestError::Blocked { artifact, rules, .. }) => {
                assert_eq!(artifact, TOKEN);
                assert_eq!(rules, vec![r"^tests/testthat/token\.json.*$"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unignore_without_other_rules_just_removes() {
        let mut list = buildignore("^tests/testthat/token\\.json$\n");
        assert!(list.unignore(Path::new(TOKEN)).unwrap());
        assert!(!list.unignore(Path::new(TOKEN)).unwrap());
        assert_eq!(list.render(), "");
    }

    #[test]
    fn ensure_appends_once_and_preserves_comments() {
        let mut list = gitignore("# R artifacts\n.Rhistory\n\n");
        assert!(list.ensure(Path::new(TOKEN)).unwrap());
        assert!(!list.ensure(Path::new(TOKEN)).unwrap());
        assert!(list.is_dirty());
        assert_eq!(list.render(), format!("# R artifacts\n.Rhistory\n\n{TOKEN}\n"));
    }

    #[test]
    fn ensure_skips_when_a_broader_rule_already_matches() {
        let mut list = gitignore("tests/testthat/*.json\n");
        assert!(!list.ensure(Path::new(TOKEN)).unwrap());
        assert!(!list.is_dirty());
    }

    #[test]
    fn remove_deletes_only_the_canonical_entry() {
        let mut list = buildignore("^README\\.Rmd$\n^tests/testthat/token\\.json$\n");
        assert!(list.remove(Path::new(TOKEN)));
        assert!(!list.remove(Path::new(TOKEN)));
        assert_eq!(list.render(), "^README\\.Rmd$\n");
    }

    #[tokio::test]
    async fn load_missing_then_save_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".gitignore");
        let mut list = IgnoreList::load(&path, IgnoreSyntax::Glob).await.unwrap();
        assert!(!list.contains(Path::new(TOKEN)).unwrap());

        list.ensure(Path::new(TOKEN)).unwrap();
        list.save().await.unwrap();
        assert!(!list.is_dirty());

        let reloaded = IgnoreList::load(&path, IgnoreSyntax::Glob).await.unwrap();
        assert!(reloaded.contains(Path::new(TOKEN)).unwrap());
    }
}
