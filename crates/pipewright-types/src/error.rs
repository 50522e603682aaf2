//! Error taxonomy shared by every pipewright component.
//!
//! Every error belongs to exactly one [`ErrorKind`]. Validation and parse
//! errors are caller-fixable and are raised before any OS call is made.
//! OS errors carry the underlying `io::Error` so the platform code survives.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::Status;

/// Result type for pipewright operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed shell text.
    Parse,
    /// Caller-fixable input problem, detected before touching the OS.
    Validation,
    /// PATH search failed.
    Resolution,
    /// The operating system refused an operation.
    Os,
    /// A waited command finished unsuccessfully.
    Failed,
    /// A process handoff channel closed before delivery.
    Handoff,
}

/// pipewright errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unterminated {quote} quote starting at byte {offset}")]
    UnterminatedQuote { quote: char, offset: usize },

    #[error("{field} contains a NUL byte at offset {offset}: {value:?}")]
    NulByte {
        field: String,
        value: String,
        offset: usize,
    },
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvName(String),
    #[error("cannot spawn a command with an empty program name")]
    EmptyProgram,
    #[error("cannot build an empty {0}")]
    EmptyPlan(&'static str),
    #[error("reset requires a mark, but none is set")]
    NotMarked,
    #[error("write side of the pipe is closed")]
    WriteClosed,
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("{name}: command not found in {searched}")]
    NotFound { name: String, searched: String },
    #[error("{}: file exists but is not executable", .path.display())]
    NotExecutable { path: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("file descriptor limit reached ({limit} allowed) while {context}")]
    DescriptorsExhausted { limit: u64, context: String },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{command}: {status}")]
    Failed { command: String, status: Status },

    #[error("process handoff closed before a process was delivered")]
    HandoffClosed,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnterminatedQuote { .. } => ErrorKind::Parse,
            Error::NulByte { .. }
            | Error::InvalidEnvName(_)
            | Error::EmptyProgram
            | Error::EmptyPlan(_)
            | Error::NotMarked
            | Error::WriteClosed
            | Error::InvalidSignal(_) => ErrorKind::Validation,
            Error::NotFound { .. } | Error::NotExecutable { .. } => ErrorKind::Resolution,
            Error::Spawn { .. }
            | Error::DescriptorsExhausted { .. }
            | Error::Signal { .. }
            | Error::Io { .. } => ErrorKind::Os,
            Error::Failed { .. } => ErrorKind::Failed,
            Error::HandoffClosed => ErrorKind::Handoff,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Platform error code, for OS errors that carry one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Spawn { source, .. } | Error::Signal { source, .. } | Error::Io { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }

    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a NUL-byte validation error for `value`, if it contains one.
    pub fn check_nul(field: impl FnOnce() -> String, value: &str) -> Result<()> {
        match value.find('\0') {
            Some(offset) => Err(Error::NulByte {
                field: field(),
                value: value.to_string(),
                offset,
            }),
            None => Ok(()),
        }
    }
}
