//! Layout consistency checks.
//!
//! Verifies that the plaintext token (P) and the encrypted token (E) are
//! routed correctly:
//! - P is ignored by version control, E is not.
//! - E is excluded from package builds; P is excluded only on submission
//!   branches.
//! - The CI config has exactly one decrypt step, reading E and writing P.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::ci::{CiConfig, CiConfigError, DecryptStep};
use crate::cipher::env_prefix;
use crate::manifest::{IgnoreList, ManifestError};
use crate::packaging::BranchMode;
use crate::store::ArtifactState;
use crate::util::slash_path;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    CiConfig(#[from] CiConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
}

impl Report {
    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.findings.push(Finding {
            severity,
            message: message.into(),
        });
    }

    fn require(&mut self, holds: bool, ok: impl Into<String>, failed: impl Into<String>) {
        if holds {
            self.push(Severity::Ok, ok);
        } else {
            self.push(Severity::Error, failed);
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Everything a layout check looks at.
#[derive(Debug)]
pub struct Layout<'a> {
    pub plaintext: &'a Path,
    pub encrypted: &'a Path,
    pub vcs_ignore: &'a IgnoreList,
    pub dist_ignore: &'a IgnoreList,
    pub ci_config: &'a CiConfig,
    /// `None` when the branch could not be determined.
    pub mode: Option<BranchMode>,
    pub artifacts: ArtifactState,
}

pub fn check_layout(layout: &Layout<'_>) -> Result<Report, CheckError> {
    let mut report = Report::default();
    let p = slash_path(layout.plaintext);
    let e = slash_path(layout.encrypted);
    let vcs = layout.vcs_ignore.path().display().to_string();
    let dist = layout.dist_ignore.path().display().to_string();

    let p_in_vcs = layout.vcs_ignore.contains(layout.plaintext)?;
    let e_in_vcs = layout.vcs_ignore.contains(layout.encrypted)?;
    let p_in_dist = layout.dist_ignore.contains(layout.plaintext)?;
    let e_in_dist = layout.dist_ignore.contains(layout.encrypted)?;

    report.require(
        p_in_vcs,
        format!("{p} is ignored by {vcs}"),
        format!("{p} is not in {vcs}; the plaintext token would be committed"),
    );
    report.require(
        !e_in_vcs,
        format!("{e} is tracked by version control"),
        format!("{e} is in {vcs}; CI will not receive the encrypted token"),
    );
    report.require(
        e_in_dist,
        format!("{e} is excluded by {dist}"),
        format!("{e} is not in {dist}; the encrypted token would ship in the package"),
    );

    match layout.mode {
        Some(mode) if mode.bundles_plaintext() => report.require(
            !p_in_dist,
            format!("{p} is bundled on the {mode} branch"),
            format!("{p} is in {dist} on the {mode} branch; run `token-vault package`"),
        ),
        Some(mode) => report.require(
            p_in_dist,
            format!("{p} is excluded on the {mode} branch"),
            format!("{p} is not in {dist} on the {mode} branch; run `token-vault package`"),
        ),
        None => report.push(
            Severity::Warning,
            "Current branch unknown; skipped the packaging check",
        ),
    }

    check_decrypt_steps(&mut report, layout.ci_config, &p, &e)?;

    if !layout.artifacts.has_encrypted() {
        report.push(
            Severity::Warning,
            format!("{e} does not exist yet; run `token-vault encrypt`"),
        );
    }

    Ok(report)
}

fn check_decrypt_steps(
    report: &mut Report,
    ci: &CiConfig,
    p: &str,
    e: &str,
) -> Result<(), CheckError> {
    let ci_path = ci.path().display().to_string();
    let steps = ci.decrypt_steps()?;
    let matching: Vec<&DecryptStep> = steps
        .iter()
        .map(|f| &f.step)
        .filter(|s| s.input == e && s.output == p)
        .collect();

    match matching.len() {
        0 => report.push(
            Severity::Error,
            format!("{ci_path} has no step decrypting {e} to {p}"),
        ),
        1 => {
            report.push(
                Severity::Ok,
                format!("{ci_path} decrypts {e} to {p} exactly once"),
            );
            let expected = env_prefix(Path::new(e));
            if matching[0].prefix != expected {
                report.push(
                    Severity::Warning,
                    format!(
                        "decrypt step uses ${} instead of ${}; make sure those CI variables exist",
                        matching[0].prefix, expected
                    ),
                );
            }
        }
        n => report.push(
            Severity::Error,
            format!("{ci_path} decrypts {e} to {p} {n} times; expected exactly one"),
        ),
    }

    for step in steps.iter().map(|f| &f.step) {
        if step.input == e && step.output != p {
            report.push(
                Severity::Error,
                format!("{ci_path} decrypts {e} to {} instead of {p}", step.output),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::IgnoreSyntax;

    const P: &str = "tests/testthat/token.json";
    const E: &str = "tests/testthat/token.json.enc";

    struct Fixture {
        vcs: IgnoreList,
        dist: IgnoreList,
        ci: CiConfig,
    }

    impl Fixture {
        fn good() -> Self {
            let step = DecryptStep::new(env_prefix(Path::new(E)), Path::new(E), Path::new(P));
            Self {
                vcs: IgnoreList::parse(".gitignore", IgnoreSyntax::Glob, &format!(".Rproj.user\n{P}\n")),
                dist: IgnoreList::parse(
                    ".Rbuildignore",
                    IgnoreSyntax::AnchoredRegex,
                    "^.*\\.Rproj$\n^tests/testthat/token\\.json\\.enc$\n",
                ),
                ci: CiConfig::parse(
                    ".travis.yml",
                    &format!("language: r\nbefore_install:\n  - \"{step}\"\n"),
                )
                .unwrap(),
            }
        }

        fn check(&self, mode: Option<BranchMode>) -> Report {
            check_layout(&Layout {
                plaintext: Path::new(P),
                encrypted: Path::new(E),
                vcs_ignore: &self.vcs,
                dist_ignore: &self.dist,
                ci_config: &self.ci,
                mode,
                artifacts: ArtifactState::Both,
            })
            .unwrap()
        }
    }

    fn error_messages(report: &Report) -> Vec<String> {
        report.errors().map(|f| f.message.clone()).collect()
    }

    #[test]
    fn consistent_layout_passes_on_default_branch() {
        let report = Fixture::good().check(Some(BranchMode::Default));
        assert!(report.is_ok(), "{:?}", error_messages(&report));
        assert_eq!(report.warnings().count(), 0);
    }

    #[test]
    fn submission_branch_requires_plaintext_exclusion() {
        let mut fixture = Fixture::good();
        let report = fixture.check(Some(BranchMode::Submission));
        assert_eq!(report.errors().count(), 1);
        assert!(error_messages(&report)[0].contains("submission"));

        fixture.dist.ensure(Path::new(P)).unwrap();
        assert!(fixture.check(Some(BranchMode::Submission)).is_ok());
        // The same list is wrong on the default branch.
        assert!(!fixture.check(Some(BranchMode::Default)).is_ok());
    }

    #[test]
    fn swapped_lists_are_both_reported() {
        let mut fixture = Fixture::good();
        fixture.vcs = IgnoreList::parse(".gitignore", IgnoreSyntax::Glob, &format!("{E}\n"));
        fixture.dist = IgnoreList::parse(
            ".Rbuildignore",
            IgnoreSyntax::AnchoredRegex,
            "^tests/testthat/token\\.json$\n",
        );
        let errors = error_messages(&fixture.check(Some(BranchMode::Default)));
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn missing_and_duplicate_decrypt_steps_are_errors() {
        let mut fixture = Fixture::good();
        fixture.ci = CiConfig::parse(".travis.yml", "language: r\n").unwrap();
        let errors = error_messages(&fixture.check(Some(BranchMode::Default)));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no step"));

        let step = DecryptStep::new(env_prefix(Path::new(E)), Path::new(E), Path::new(P));
        fixture.ci = CiConfig::parse(
            ".travis.yml",
            &format!("before_install:\n  - \"{step}\"\nbefore_script:\n  - \"{step}\"\n"),
        )
        .unwrap();
        let errors = error_messages(&fixture.check(Some(BranchMode::Default)));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("2 times"));
    }

    #[test]
    fn wrong_output_and_foreign_prefix_are_flagged() {
        let mut fixture = Fixture::good();
        let wrong = DecryptStep::new("encrypted_abcdefabcdef", Path::new(E), Path::new("token.json"));
        let foreign = DecryptStep::new("encrypted_abcdefabcdef", Path::new(E), Path::new(P));
        fixture.ci = CiConfig::parse(
            ".travis.yml",
            &format!("before_install:\n  - \"{wrong}\"\n  - \"{foreign}\"\n"),
        )
        .unwrap();
        let report = fixture.check(Some(BranchMode::Default));
        let errors = error_messages(&report);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("instead of"));
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn unknown_branch_and_missing_artifact_warn() {
        let fixture = Fixture::good();
        let report = check_layout(&Layout {
            plaintext: Path::new(P),
            encrypted: Path::new(E),
            vcs_ignore: &fixture.vcs,
            dist_ignore: &fixture.dist,
            ci_config: &fixture.ci,
            mode: None,
            artifacts: ArtifactState::PlaintextOnly,
        })
        .unwrap();
        assert!(report.is_ok());
        assert_eq!(report.warnings().count(), 2);
    }
}
