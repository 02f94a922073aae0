//! Typed error hierarchy for the capture engine.
//!
//! Uses `thiserror` for library-grade errors.  Each variant maps to a stable
//! integer code via [`CastError::error_code`] so the process exit status can
//! be consumed by scripts without string parsing.
//!
//! Backpressure (no free slot or slice) and encoder lag (submit produced no
//! packet yet) are deliberately *not* errors — they are normal steady-state
//! conditions handled at the component boundary where they occur.

/// All errors originating from the capture/encode core.
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    // ── Capture open (resource acquisition) ──────────────────────────
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Required capture extension missing: {0}")]
    ExtensionMissing(String),

    #[error("Capture extension too old: {major}.{minor} < {need_major}.{need_minor}")]
    ExtensionTooOld {
        major: i32,
        minor: i32,
        need_major: i32,
        need_minor: i32,
    },

    #[error("No capture target matching '{0}' was found")]
    TargetNotFound(String),

    #[error("No rendering configuration compatible with target depth {depth}")]
    NoCompatibleConfig { depth: i32 },

    #[error("Resource allocation failed: {0}")]
    ResourceAlloc(String),

    /// Asynchronous error reported by the capture environment, observed via
    /// the process-wide error channel after a sensitive call.
    #[error("Capture environment reported: {0}")]
    Environment(String),

    // ── Codecs / output ──────────────────────────────────────────────
    #[error("Scale error: {0}")]
    Scale(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Mux error: {0}")]
    Mux(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    // ── Invariants ───────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl CastError {
    /// Stable integer error code for the process exit status.
    ///
    /// Codes are grouped by category:
    /// - 1xx: capture open / resource acquisition
    /// - 3xx: scale / encode / mux
    /// - 4xx: pipeline
    /// - 6xx: invariant violations
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Capture(_) => 100,
            Self::ExtensionMissing(_) => 101,
            Self::ExtensionTooOld { .. } => 102,
            Self::TargetNotFound(_) => 103,
            Self::NoCompatibleConfig { .. } => 104,
            Self::ResourceAlloc(_) => 105,
            Self::Environment(_) => 106,
            Self::Scale(_) => 300,
            Self::Encode(_) => 301,
            Self::Mux(_) => 302,
            Self::Pipeline(_) => 400,
            Self::ChannelClosed => 401,
            Self::InvariantViolation(_) => 600,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CastError>;
