//! Typed errors for the instrumentation sub-system.

use thiserror::Error;

/// Errors surfaced by [`InstrumentationController`](crate::InstrumentationController).
///
/// These are fatal only to the `instrument` / `uninstrument` call that
/// produced them; the host application keeps running untouched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstrumentationError {
    /// A patch set is already active for this framework target.
    #[error("Target '{target}' is already instrumented")]
    AlreadyInstrumented {
        /// Framework target name.
        target: String,
    },

    /// `uninstrument` was called while no patch set was active.
    #[error("Target '{target}' is not instrumented")]
    NotInstrumented {
        /// Framework target name.
        target: String,
    },

    /// The host framework reports a version outside the supported range.
    #[error("Target '{target}' version {version} is not supported (requires {supported})")]
    UnsupportedVersion {
        /// Framework target name.
        target: String,
        /// Version reported by the framework.
        version: String,
        /// Declared supported range.
        supported: String,
    },

    /// An individual patch failed; every patch of the same call was rolled back.
    #[error("Failed to patch entry point '{entry_point}': {source}")]
    PatchFailed {
        /// Entry point that could not be patched.
        entry_point: String,
        /// Underlying patch failure.
        #[source]
        source: PatchError,
    },

    /// Instrumentation options are invalid.
    #[error("Invalid instrumentation options: {0}")]
    InvalidOptions(String),
}

/// Instrumentation result type using the typed [`InstrumentationError`].
pub type InstrumentationResult<T> = Result<T, InstrumentationError>;

/// Errors raised while applying or reverting a single patch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PatchError {
    /// The slot no longer holds the handler the patch installed, so the
    /// original cannot be restored without clobbering a foreign handler.
    #[error("Hook slot '{0}' holds a foreign handler")]
    SlotMismatch(String),

    /// The patch was applied twice or reverted without being applied.
    #[error("Patch for '{entry_point}' is in state {actual}, expected {expected}")]
    InvalidState {
        /// Entry point of the patch.
        entry_point: String,
        /// State that was expected.
        expected: &'static str,
        /// State the patch was in.
        actual: &'static str,
    },

    /// Framework-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Errors raised by span exporters. Never propagated into application code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    /// The sink has been shut down and no longer accepts records.
    #[error("Exporter has been shut down")]
    Shutdown,

    /// The hand-off channel to a background exporter is closed.
    #[error("Export channel closed")]
    ChannelClosed,

    /// A (de)serialization error surfaced while formatting a record.
    #[error("Export serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Export result type using the typed [`ExportError`].
pub type ExportResult<T> = Result<T, ExportError>;
