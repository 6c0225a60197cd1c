//! Core types for the Forge self-extending capability pipeline.
//!
//! This crate defines the data model shared by the loader, sandbox verifier,
//! registry and synthesizer. It contains no business logic.

pub mod capability;
pub mod config;
pub mod error;
pub mod verification;
