//! Errors surfaced by the runtime.
//!
//! Conflicts are in-band and recovered internally; they never appear here.
//! What the caller can see is a configuration problem (reported before any
//! worker starts) or an operator failure (the first fault raised by the
//! operator, re-raised after the loop has shut down cleanly).

use amorph_core::options::ConfigError;

/// Error returned by the top-level loop entry points.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The loop options were invalid; nothing ran.
    #[error("invalid loop configuration: {0}")]
    Config(#[from] ConfigError),
    /// The operator failed (or panicked) on some iteration. The loop shut
    /// down break-style; counters were still reported.
    #[error("operator failed in loop `{loopname}`: {message}")]
    Operator { loopname: String, message: String },
}
