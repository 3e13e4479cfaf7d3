//! Per-loop configuration.
//!
//! [`LoopOptions`] collects everything a caller can tune about one parallel
//! loop: a diagnostic name, which executor features the operator needs, the
//! worklist chunk size, and an escalation-policy override. Invalid
//! combinations are rejected by [`LoopOptions::validate`] before any worker
//! starts.

use crate::escalation::EscalationPolicy;

/// Default worklist chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 32;

/// Name used in reports when the caller does not set one.
pub const UNNAMED_LOOP: &str = "unnamed";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A configuration problem detected before the parallel region starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("worklist chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("loop name must not be empty")]
    EmptyLoopName,
}

// ---------------------------------------------------------------------------
// LoopOptions
// ---------------------------------------------------------------------------

/// Configuration for one `for_each` loop.
///
/// The `needs_*` flags describe what the operator may do; the executor uses
/// them to skip machinery the operator cannot exercise. Defaults assume a
/// speculative operator that neither pushes new work, allocates from the
/// per-iteration arena, nor breaks out of the loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Diagnostic label attached to the loop's report.
    pub loopname: Option<String>,
    /// Operator may conflict with concurrent iterations; speculation needed.
    pub needs_aborts: bool,
    /// Operator may push new items.
    pub needs_push: bool,
    /// Operator uses the per-iteration arena.
    pub needs_arena: bool,
    /// Operator may request an early break.
    pub needs_break: bool,
    /// Record the loop's report in the runtime's statistics sink.
    pub needs_stats: bool,
    /// Chunk size for the default chunked-FIFO worklist.
    pub chunk_size: usize,
    /// Escalation override; `None` selects by package topology.
    pub escalation: Option<EscalationPolicy>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            loopname: None,
            needs_aborts: true,
            needs_push: false,
            needs_arena: false,
            needs_break: false,
            needs_stats: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            escalation: None,
        }
    }
}

impl LoopOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the diagnostic loop name.
    pub fn name(mut self, loopname: impl Into<String>) -> Self {
        self.loopname = Some(loopname.into());
        self
    }

    /// Declare that the operator never conflicts (disables speculation).
    pub fn no_aborts(mut self) -> Self {
        self.needs_aborts = false;
        self
    }

    /// Declare that the operator may push new items.
    pub fn with_push(mut self) -> Self {
        self.needs_push = true;
        self
    }

    /// Declare that the operator uses the per-iteration arena.
    pub fn with_arena(mut self) -> Self {
        self.needs_arena = true;
        self
    }

    /// Declare that the operator may break out of the loop.
    pub fn with_break(mut self) -> Self {
        self.needs_break = true;
        self
    }

    /// Skip recording this loop in the statistics sink.
    pub fn no_stats(mut self) -> Self {
        self.needs_stats = false;
        self
    }

    /// Override the worklist chunk size.
    pub fn chunk(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Force a specific escalation policy.
    pub fn escalate(mut self, policy: EscalationPolicy) -> Self {
        self.escalation = Some(policy);
        self
    }

    /// The report label: the configured name or [`UNNAMED_LOOP`].
    pub fn label(&self) -> &str {
        self.loopname.as_deref().unwrap_or(UNNAMED_LOOP)
    }

    /// Reject invalid configurations before any worker starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if matches!(self.loopname.as_deref(), Some("")) {
            return Err(ConfigError::EmptyLoopName);
        }
        Ok(())
    }
}
