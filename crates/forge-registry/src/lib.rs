//! Capability registry for Forge.
//!
//! The registry owns the on-disk catalog of verified capabilities and keeps
//! the dynamic loader in step with it.

pub mod registry;
pub mod stats;
pub mod verify;

pub use registry::{CapabilityEntry, CapabilityRegistry, EntryState, ReloadReport};
pub use stats::StatsStore;

use forge_runtime::loader::LoadError;
use forge_types::error::ForgeError;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid capability name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Capability '{name}' rejected by loader: {reason}")]
    Rejected { name: String, reason: LoadError },
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry index error: {0}")]
    Index(#[from] serde_json::Error),
}

impl From<RegistryError> for ForgeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidName { name, reason } => {
                ForgeError::InvalidName(format!("{name}: {reason}"))
            }
            other => ForgeError::Registration(other.to_string()),
        }
    }
}
