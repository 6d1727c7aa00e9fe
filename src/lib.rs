//! repoexport - an asynchronous repository export service
//!
//! Ingests a remote repository (owner, repo, git reference) and produces one
//! of three downloadable artifacts: a filtered ZIP of text sources, a single
//! concatenated text file with per-file headers, or a token-budgeted prompt
//! pack for feeding a code corpus to an LLM.

/// Returns the repoexport version string.
#[must_use]
pub fn repoexport_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Version tag folded into derived idempotency keys. Bump when the export
/// output format changes incompatibly so old keys stop collapsing new runs.
pub const EXPORTER_VERSION: &str = "1";

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod exports;
pub mod github;
pub mod logging;
pub mod matcher;
pub mod queue;
pub mod runner;
pub mod secrets;
pub mod server;
pub mod tokens;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, FetchError, PathError};
pub use types::*;
