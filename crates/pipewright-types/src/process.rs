//! Process identification, lifecycle state, and aggregate status types.

use serde::{Deserialize, Serialize};

/// Opaque identifier handed out by a spawner's process registry.
///
/// Ids are unique per spawner and never reused. They identify both
/// top-level process handles and the individual OS processes inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a single OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ProcessState {
    /// Still running (or exited but not yet reaped).
    Running,
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ProcessState {
    /// True once the process has terminated, either way.
    pub fn is_finished(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }

    /// True only for a normal exit with code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessState::Exited(0))
    }

    /// Shell-style numeric code: the exit code, or `128 + signal`.
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessState::Running => None,
            ProcessState::Exited(code) => Some(*code),
            ProcessState::Signaled(sig) => Some(128 + sig),
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(code) => write!(f, "exited with code {}", code),
            ProcessState::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

/// Aggregate outcome of a command, pipeline, or parallel group.
///
/// `state` is the representative state: the last stage of a pipeline, or
/// the first failing member of a parallel group (else its last member).
/// `success` already accounts for ignore-status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: ProcessState,
    pub success: bool,
}

impl Status {
    pub fn new(state: ProcessState, success: bool) -> Self {
        Self { state, success }
    }

    /// Status of a single process, treating any failure as success when
    /// `ignore_status` is set.
    pub fn from_state(state: ProcessState, ignore_status: bool) -> Self {
        Self {
            state,
            success: state.is_success() || (ignore_status && state.is_finished()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn code(&self) -> Option<i32> {
        self.state.code()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.success || self.state.is_success() {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{} (ignored)", self.state)
        }
    }
}

/// Snapshot of one live OS process, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Registry id of this OS process.
    pub id: ProcessId,
    /// Id of the top-level handle that launched it.
    pub owner: ProcessId,
    /// OS process id.
    pub pid: u32,
    /// Command line, shell-escaped.
    pub command: String,
    /// Current state.
    pub state: ProcessState,
}
