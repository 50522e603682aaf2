//! Scheduler module for pipewright: launching plans and tracking processes.
//!
//! This module provides:
//! - **Pipe streams**: buffered OS pipes linking stages and capturing output
//! - **Spawning**: validate, resolve, wire and launch a [`crate::Plan`]
//! - **Process handles**: wait, kill and exit-status aggregation
//! - **Registry**: every unreaped child, keyed by [`ProcessId`](pipewright_types::ProcessId)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Spawner                             │
//! │  ┌─────────┐  PipeStream ┌─────────┐  PipeStream ┌────────┐  │
//! │  │ child 1 │────────────▶│ child 2 │────────────▶│ child 3│  │
//! │  │ (spawn) │   stdout    │ (spawn) │   stdout    │ (spawn)│  │
//! │  └─────────┘             └─────────┘             └────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Registry                            │
//! │  live: HashMap<ProcessId, Arc<ChildProcess>>                 │
//! │  - insert on launch, remove on reap                          │
//! │  - live() / wait_all() / kill_all() / reap() on the Spawner  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod handoff;
mod limits;
mod pipe_stream;
mod process;
mod registry;
mod signal;
mod spawner;

pub use handoff::{ProcessReceiver, ProcessSender, handoff};
pub use limits::descriptor_limit;
pub use pipe_stream::PipeStream;
pub use process::{ChildProcess, Process};
pub use signal::parse_signal;
pub use spawner::{SpawnMode, Spawner};
