//! Error types shared by all operators.

use thiserror::Error;

/// Errors surfaced by operator construction and evaluation.
///
/// Pattern-compile failures are deliberately absent: a regex that fails to
/// compile degrades the owning matcher to a pass-through no-op instead of
/// aborting evaluation (see [`crate::regex::PcreMatcher`]).
#[derive(Error, Debug)]
pub enum OpError {
    /// Invalid attribute value, unknown enum name, or an inconsistency in a
    /// vocabulary/merge table detected while building operator caches.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tensor length, offset, or element-type mismatch detected at
    /// `evaluate` entry.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Internal invariant violation while writing output.
    #[error("data invariant violated: {0}")]
    Data(String),
}

/// Reads a boolean environment variable accepting `0/1/true/false/on/off`.
pub(crate) fn getenv_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => true,
            "0" | "false" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Whether diagnostic messages should be mirrored to stderr in addition to
/// the `log` facade.
pub(crate) fn diagnostics_enabled() -> bool {
    getenv_bool("RAGTOK_PRINT_DEBUG_INFO", false)
}
