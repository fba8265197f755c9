//! Error types for the EE/GC boundary

use thiserror::Error;

/// Failure taxonomy shared by every component.
///
/// `Overflow` and `OutOfMemory` are value-returned to callers. The other two are
/// fatal: the exported entry points hand them to [`fail_fast`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// Caller-supplied size or element count cannot be represented
    #[error("allocation size overflow")]
    Overflow,

    /// The collector could not satisfy the request, even after a collection
    #[error("out of memory")]
    OutOfMemory,

    /// A precondition was broken by the caller
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A thread could not be brought to a safe point
    #[error("suspension failure: {0}")]
    SuspensionFailure(String),
}

impl GcError {
    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a suspension failure
    pub fn suspension(msg: impl Into<String>) -> Self {
        Self::SuspensionFailure(msg.into())
    }

    /// True for errors after which heap consistency can no longer be proven.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_) | Self::SuspensionFailure(_)
        )
    }
}

/// Result type using GcError
pub type GcResult<T> = Result<T, GcError>;

/// Log a fatal error and terminate the process without unwinding.
///
/// Unwinding through a heap in an unknown state is not an option, so this
/// never returns.
#[cold]
pub fn fail_fast(err: &GcError) -> ! {
    tracing::error!(target: "ee_gc::fatal", error = %err, "fatal EE/GC error, terminating");
    std::process::abort()
}
