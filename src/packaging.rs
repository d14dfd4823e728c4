//! Conditional packaging filter.
//!
//! The plaintext token is bundled into package builds on the default branch
//! (so the installed tests can authenticate) and excluded on submission
//! branches, where the build is uploaded to a public registry.

use std::path::Path;

use serde::Serialize;

use crate::manifest::{IgnoreList, ManifestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// Plaintext token included in the package bundle.
    Default,
    /// Plaintext token excluded from the package bundle.
    Submission,
}

impl BranchMode {
    pub fn for_branch(branch: &str, submission_branches: &[String]) -> Self {
        if submission_branches.iter().any(|b| b == branch) {
            Self::Submission
        } else {
            Self::Default
        }
    }

    pub fn bundles_plaintext(self) -> bool {
        matches!(self, Self::Default)
    }
}

impl std::fmt::Display for BranchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Submission => f.write_str("submission"),
        }
    }
}

/// Add or remove the plaintext path in the distribution ignore list to match
/// `mode`. Returns whether the list changed.
///
/// In default mode a broader rule that still excludes the plaintext is an
/// error (`ManifestError::Blocked`) naming that rule.
pub fn apply_branch_mode(
    dist_ignore: &mut IgnoreList,
    plaintext: &Path,
    mode: BranchMode,
) -> Result<bool, ManifestError> {
    match mode {
        BranchMode::Submission => dist_ignore.ensure(plaintext),
        BranchMode::Default => dist_ignore.unignore(plaintext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::IgnoreSyntax;

    const TOKEN: &str = "tests/testthat/token.json";

    fn branches() -> Vec<String> {
        vec!["cran".to_string(), "release".to_string()]
    }

    #[test]
    fn mode_follows_branch_name() {
        assert_eq!(BranchMode::for_branch("cran", &branches()), BranchMode::Submission);
        assert_eq!(BranchMode::for_branch("release", &branches()), BranchMode::Submission);
        assert_eq!(BranchMode::for_branch("master", &branches()), BranchMode::Default);
        assert_eq!(BranchMode::for_branch("cran-fixes", &branches()), BranchMode::Default);
        assert!(BranchMode::Default.bundles_plaintext());
        assert!(!BranchMode::Submission.bundles_plaintext());
    }

    #[test]
    fn switching_modes_toggles_the_plaintext_entry() {
        let mut list = IgnoreList::parse(
            ".Rbuildignore",
            IgnoreSyntax::AnchoredRegex,
            "^tests/testthat/token\\.json\\.enc$\n",
        );
        let token = Path::new(TOKEN);

        assert!(apply_branch_mode(&mut list, token, BranchMode::Submission).unwrap());
        assert!(list.contains(token).unwrap());
        assert!(!apply_branch_mode(&mut list, token, BranchMode::Submission).unwrap());

        assert!(apply_branch_mode(&mut list, token, BranchMode::Default).unwrap());
        assert!(!list.contains(token).unwrap());
        // The encrypted entry is untouched either way.
        assert!(list.contains(Path::new("tests/testthat/token.json.enc")).unwrap());
    }

    #[test]
    fn default_mode_rejects_a_broader_rule_covering_the_token() {
        let mut list = IgnoreList::parse(
            ".Rbuildignore",
            IgnoreSyntax::AnchoredRegex,
            "^tests/testthat/token\\.json$\n^tests/testthat/token\\.json.*$\n",
        );
        match apply_branch_mode(&mut list, Path::new(TOKEN), BranchMode::Default) {
            Err(ManifestError::Blocked { rules, .. }) => {
                assert_eq!(rules, vec![r"^tests/testthat/token\.json.*$"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn applied_mode_survives_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".Rbuildignore");
        let token = Path::new(TOKEN);

        tokio_test::block_on(async {
            let mut list = IgnoreList::load(&path, IgnoreSyntax::AnchoredRegex).await.unwrap();
            apply_branch_mode(&mut list, token, BranchMode::Submission).unwrap();
            list.save().await.unwrap();

            let reloaded = IgnoreList::load(&path, IgnoreSyntax::AnchoredRegex).await.unwrap();
            assert!(reloaded.contains(token).unwrap());
        });
    }
}
