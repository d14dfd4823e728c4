//! # token-vault
//!
//! Manages one OAuth credential used by a project's test suite through its
//! whole lifecycle:
//!
//! ```text
//!   login ──► token.json ──encrypt──► token.json.enc ──(commit)──► CI
//!   (OAuth)   (git-ignored)           (build-ignored)              │
//!                                                                  ▼
//!                               openssl aes-256-cbc -d  ◄── $encrypted_<hash>_key/_iv
//! ```
//!
//! ## Flow
//! 1. `login` runs a PKCE authorization-code flow and writes the token file
//! 2. `encrypt` encrypts it, registers the key/IV with the CI provider and
//!    updates `.gitignore`, `.Rbuildignore` and `.travis.yml`
//! 3. CI runs `decrypt` (or the equivalent `openssl` line) before tests
//! 4. `package` excludes the plaintext token from builds on submission branches
//! 5. `check` verifies the whole layout; `rotate` starts over
//!
//! ## Modules
//! - `oauth`: token acquisition and refresh
//! - `store`: plaintext credential persistence
//! - `cipher`: AES-256-CBC compatible with `openssl -K/-iv`
//! - `manifest`: ignore-list editing
//! - `ci`: CI config, key registration and repository slug
//! - `packaging`: default vs submission branch handling
//! - `check`: layout consistency report
//! - `workflow`: the operations above composed per project

pub mod check;
pub mod ci;
pub mod cipher;
pub mod config;
pub mod git;
pub mod manifest;
pub mod oauth;
pub mod packaging;
pub mod settings;
pub mod store;
pub mod util;
pub mod workflow;

pub use config::Config;
pub use settings::{Settings, SettingsStore};
pub use workflow::Project;
