//! Execution layer for Forge capabilities.
//!
//! - [`loader`] materializes WAT source as a named, invokable unit inside
//!   the running process and hot-swaps it by name.
//! - [`sandbox`] runs candidate source in an isolated child process with a
//!   wall-clock deadline and classifies the result.
//! - [`generator`] and [`context_search`] are the collaborator seams the
//!   synthesizer drives; [`drivers`] holds their HTTP implementations.

pub mod context_search;
pub mod drivers;
pub mod generator;
pub mod host_functions;
pub mod loader;
pub mod runner;
pub mod sandbox;
pub mod subprocess_sandbox;
