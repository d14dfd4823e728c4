//! CI provider integration.
//!
//! - `travis`: the CI configuration file and its decrypt step
//! - `registry`: pushing the key/IV to the provider as private variables
//! - `slug`: which repository the provider should register them under

pub mod registry;
pub mod slug;
pub mod travis;

pub use registry::{KeyRegistry, RegistryError, TravisRegistry};
pub use slug::{fix_slug, resolve_slug, ResolvedSlug, SlugError, SlugSource};
pub use travis::{CiConfig, CiConfigError, DecryptStep, FoundStep};
