//! Shared error types for the Forge pipeline.

use thiserror::Error;

/// Top-level error type surfaced to callers of the capability pipeline.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// The text generator failed or returned unusable text.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Candidate source did not pass the sandbox.
    #[error("Verification failed: {diagnostic}")]
    Verification {
        /// Last diagnostic reported by the sandbox.
        diagnostic: String,
        /// Whether the child process was killed for exceeding its deadline.
        timed_out: bool,
    },

    /// Persistence or load failure after verification passed. Always rolled back.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// An active capability failed while it was being invoked.
    #[error("Capability '{name}' failed at run time: {reason}")]
    Runtime {
        /// The capability that failed.
        name: String,
        /// Why it failed.
        reason: String,
    },

    /// The requested capability is not active.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// A capability name that cannot be used as a registry key.
    #[error("Invalid capability name: {0}")]
    InvalidName(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with ForgeError.
pub type ForgeResult<T> = Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_display_uses_diagnostic() {
        let err = ForgeError::Verification {
            diagnostic: "ZeroDivisionError".to_string(),
            timed_out: false,
        };
        assert_eq!(err.to_string(), "Verification failed: ZeroDivisionError");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ForgeError = io.into();
        assert!(matches!(err, ForgeError::Io(_)));
    }
}
