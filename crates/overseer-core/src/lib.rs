//! Core error definitions for the Overseer orchestration engine.
//!
//! This crate provides the error type shared by the engine, the gateway and the
//! command-line binary.
//!
//! # Main types
//!
//! - [`OverseerError`]: Unified error enum for all Overseer subsystems.
//! - [`OverseerResult`]: Convenience alias for `Result<T, OverseerError>`.

/// Error type and result alias.
pub mod error;

pub use error::{OverseerError, OverseerResult};
