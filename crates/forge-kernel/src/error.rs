//! Kernel-specific error types.

use forge_types::error::ForgeError;
use thiserror::Error;

/// Kernel error type wrapping ForgeError with boot context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped ForgeError.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
