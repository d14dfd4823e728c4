//! CI configuration editing (`.travis.yml`).
//!
//! The CI job decrypts the committed token before the test phase with an
//! `openssl aes-256-cbc ... -d` line. This module finds such lines in the
//! build-phase sections and inserts or repairs the one for our artifact.
//! The YAML is re-serialized on save, so comments in the file are not kept.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::cipher::{iv_var_name, key_var_name};
use crate::util::slash_path;

/// Section that new decrypt steps are added to.
pub const DECRYPT_SECTION: &str = "before_install";

/// Sections that run before tests and may hold a decrypt step.
const SCANNED_SECTIONS: &[&str] = &["before_install", "install", "before_script"];

#[derive(Debug, Error)]
pub enum CiConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: expected a mapping at the top level")]
    NotAMapping { path: PathBuf },

    #[error("{path}: section `{section}` must be a string or a list of strings")]
    BadSection { path: PathBuf, section: String },
}

/// One `openssl aes-256-cbc ... -d` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptStep {
    /// Env-var prefix (`encrypted_<hash>`).
    pub prefix: String,
    /// Encrypted file, relative to the project root.
    pub input: String,
    /// Plaintext file, relative to the project root.
    pub output: String,
}

impl DecryptStep {
    pub fn new(prefix: impl Into<String>, input: &Path, output: &Path) -> Self {
        Self {
            prefix: prefix.into(),
            input: slash_path(input),
            output: slash_path(output),
        }
    }

    /// Parse a shell command; `None` if it is not a decrypt step.
    pub fn parse(command: &str) -> Option<Self> {
        let mut tokens = command.split_whitespace();
        if tokens.next()? != "openssl" || tokens.next()? != "aes-256-cbc" {
            return None;
        }

        let (mut key, mut iv, mut input, mut output, mut decrypt) = (None, None, None, None, false);
        while let Some(flag) = tokens.next() {
            match flag {
                "-K" => key = tokens.next(),
                "-iv" => iv = tokens.next(),
                "-in" => input = tokens.next(),
                "-out" => output = tokens.next(),
                "-d" => decrypt = true,
                _ => {}
            }
        }
        if !decrypt {
            return None;
        }

        let prefix = env_ref(key?)?.strip_suffix("_key")?.to_string();
        if env_ref(iv?)? != iv_var_name(&prefix) {
            return None;
        }

        Some(Self {
            prefix,
            input: input?.trim_start_matches("./").to_string(),
            output: output?.trim_start_matches("./").to_string(),
        })
    }

    /// Whether this step decrypts the same file to the same place as `other`.
    pub fn same_target(&self, other: &DecryptStep) -> bool {
        self.input == other.input && self.output == other.output
    }
}

impl fmt::Display for DecryptStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "openssl aes-256-cbc -K ${} -iv ${} -in {} -out {} -d",
            key_var_name(&self.prefix),
            iv_var_name(&self.prefix),
            self.input,
            self.output
        )
    }
}

/// `$NAME` or `${NAME}` -> `NAME`.
fn env_ref(token: &str) -> Option<&str> {
    let name = token.strip_prefix('$')?;
    let name = match name.strip_prefix('{') {
        Some(inner) => inner.strip_suffix('}')?,
        None => name,
    };
    (!name.is_empty()).then_some(name)
}

/// A decrypt step found in the config, with the section it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundStep {
    pub section: String,
    pub step: DecryptStep,
}

/// The CI configuration document.
#[derive(Debug, Clone)]
pub struct CiConfig {
    path: PathBuf,
    doc: Mapping,
    dirty: bool,
}

impl CiConfig {
    /// Load the config at `path`. A missing or empty file is an empty mapping.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CiConfigError> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(CiConfigError::Io { path, source }),
        };
        Self::parse(path, &contents)
    }

    pub fn parse(path: impl Into<PathBuf>, contents: &str) -> Result<Self, CiConfigError> {
        let path = path.into();
        let doc = if contents.trim().is_empty() {
            Mapping::new()
        } else {
            match serde_yaml::from_str::<Value>(contents) {
                Ok(Value::Mapping(m)) => m,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => return Err(CiConfigError::NotAMapping { path }),
                Err(source) => return Err(CiConfigError::Yaml { path, source }),
            }
        };
        Ok(Self {
            path,
            doc,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn section_commands(&self, section: &str) -> Result<Vec<String>, CiConfigError> {
        let bad = || CiConfigError::BadSection {
            path: self.path.clone(),
            section: section.to_string(),
        };
        match self.doc.get(section) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(bad))
                .collect(),
            Some(_) => Err(bad()),
        }
    }

    fn set_section_commands(&mut self, section: &str, commands: Vec<String>) {
        let key = Value::String(section.to_string());
        if commands.is_empty() {
            self.doc.remove(&key);
        } else {
            self.doc.insert(
                key,
                Value::Sequence(commands.into_iter().map(Value::String).collect()),
            );
        }
        self.dirty = true;
    }

    /// Every decrypt step in the scanned sections, in file order.
    pub fn decrypt_steps(&self) -> Result<Vec<FoundStep>, CiConfigError> {
        let mut found = Vec::new();
        for section in SCANNED_SECTIONS {
            for command in self.section_commands(section)? {
                if let Some(step) = DecryptStep::parse(&command) {
                    found.push(FoundStep {
                        section: section.to_string(),
                        step,
                    });
                }
            }
        }
        Ok(found)
    }

    /// Make `step` the one and only decrypt step for its input/output pair.
    ///
    /// Steps for the same pair with a stale prefix are rewritten in place and
    /// duplicates are dropped. If none exists, the step is appended to
    /// `before_install`. Returns whether the document changed.
    pub fn ensure_decrypt_step(&mut self, step: &DecryptStep) -> Result<bool, CiConfigError> {
        let rendered = step.to_string();
        let mut placed = false;
        let mut changed = false;

        for section in SCANNED_SECTIONS {
            let commands = self.section_commands(section)?;
            let mut updated = Vec::with_capacity(commands.len());
            let mut section_changed = false;

            for command in commands {
                match DecryptStep::parse(&command) {
                    Some(existing) if existing.same_target(step) => {
                        if placed {
                            section_changed = true;
                            continue;
                        }
                        placed = true;
                        if existing != *step {
                            tracing::info!("Replacing stale decrypt step in {}", section);
                            section_changed = true;
                            updated.push(rendered.clone());
                        } else {
                            updated.push(command);
                        }
                    }
                    _ => updated.push(command),
                }
            }

            if section_changed {
                self.set_section_commands(section, updated);
                changed = true;
            }
        }

        if !placed {
            let mut commands = self.section_commands(DECRYPT_SECTION)?;
            tracing::info!("Adding decrypt step to {}", DECRYPT_SECTION);
            commands.push(rendered);
            self.set_section_commands(DECRYPT_SECTION, commands);
            changed = true;
        }

        Ok(changed)
    }

    pub fn render(&self) -> Result<String, CiConfigError> {
        serde_yaml::to_string(&self.doc).map_err(|source| CiConfigError::Yaml {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the document back if it changed.
    pub async fn save(&mut self) -> Result<(), CiConfigError> {
        if !self.dirty {
            return Ok(());
        }
        let contents = self.render()?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|source| CiConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.dirty = false;
        Ok(())
    }
}
