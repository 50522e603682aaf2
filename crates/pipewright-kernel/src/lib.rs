//! pipewright-kernel: build, compose and run external processes.
//!
//! Unix only: descriptors, signals and process groups come from `nix`.
//!
//! This crate provides:
//!
//! - **Lexer**: splits shell-quoted command lines into words
//! - **Escape**: renders argument vectors back into command lines, in a
//!   native and a POSIX-portable dialect
//! - **Which**: resolves program names against a search path
//! - **Command / Plan**: single invocations, composed with `|` and `&`
//! - **Scheduler**: pipe streams, the spawner, and process handles
//! - **Config**: spawner and resolver settings
//!
//! ```no_run
//! use pipewright_kernel::{Command, Spawner, SpawnerConfig};
//!
//! # async fn demo() -> pipewright_kernel::Result<()> {
//! let spawner = Spawner::new(SpawnerConfig::from_env());
//! let out = spawner
//!     .read_to_string(Command::new("printf").arg("b\\na\\n") | Command::new("sort"))
//!     .await?;
//! assert_eq!(out, "a\nb\n");
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod escape;
pub mod lexer;
pub mod plan;
pub mod scheduler;
pub mod which;

pub use command::{Command, Env};
pub use config::{CurrentDirPolicy, ResolverConfig, SpawnerConfig, StdinPolicy};
pub use escape::{escape, escape_portable};
pub use lexer::split;
pub use plan::{FileMode, FileTarget, InheritedHandle, Plan, PlanKind, Redirect, Redirects};
pub use scheduler::{PipeStream, Process, SpawnMode, Spawner, parse_signal};
pub use which::{Resolver, which};

// Shared data types, so embedders need only this crate
pub use pipewright_types::{Error, ErrorKind, ProcessId, ProcessInfo, ProcessState, Result, Status};
