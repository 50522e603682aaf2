//! Pure data types for pipewright: process identity, exit states and errors.
//!
//! This crate is a leaf dependency with no async runtime and no I/O.
//! It exists so that consumers can inspect process outcomes and classify
//! errors without pulling in the kernel's tokio and nix stack.

pub mod error;
pub mod process;

// Flat re-exports for convenience
pub use error::*;
pub use process::*;
