//! Forge kernel: the capability synthesizer and the API the rest of the
//! application calls.
//!
//! [`ForgeKernel`] wires the dynamic loader, sandbox verifier, registry and
//! collaborators together from a [`ForgeConfig`](forge_types::config::ForgeConfig).

pub mod config;
pub mod error;
pub mod kernel;
pub mod synthesizer;

pub use kernel::ForgeKernel;
pub use synthesizer::{CapabilitySynthesizer, SynthesisRequest, SynthesisState};
