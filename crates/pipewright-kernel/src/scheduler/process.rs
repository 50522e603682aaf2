//! Handles for launched processes.
//!
//! A [`Process`] is what a spawn call returns. It owns one [`ChildProcess`]
//! per OS process, arranged in the same tree as the plan that produced it,
//! and aggregates their exit states into a [`Status`].

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex, Weak};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use pipewright_types::{Error, ProcessId, ProcessInfo, ProcessState, Result, Status};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::pipe_stream::PipeStream;
use super::registry::Registry;
use super::signal::to_signal;

/// One OS process.
pub struct ChildProcess {
    id: ProcessId,
    owner: ProcessId,
    pid: u32,
    command: String,
    ignore_status: bool,
    /// `None` once reaped.
    child: AsyncMutex<Option<tokio::process::Child>>,
    state: Mutex<ProcessState>,
    registry: Weak<Registry>,
}

impl ChildProcess {
    pub(crate) fn new(
        id: ProcessId,
        owner: ProcessId,
        command: String,
        ignore_status: bool,
        child: tokio::process::Child,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            owner,
            pid: child.id().unwrap_or(0),
            command,
            ignore_status,
            child: AsyncMutex::new(Some(child)),
            state: Mutex::new(ProcessState::Running),
            registry,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> Status {
        Status::from_state(self.state(), self.ignore_status)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id,
            owner: self.owner,
            pid: self.pid,
            command: self.command.clone(),
            state: self.state(),
        }
    }

    /// Wait for exit. Safe to cancel; a later call picks up where this one
    /// left off.
    pub async fn wait(&self) -> Result<ProcessState> {
        let state = self.state();
        if state.is_finished() {
            return Ok(state);
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let status = child
                .wait()
                .await
                .map_err(|e| Error::io(format!("waiting for process {}", self.pid), e))?;
            *guard = None;
            self.finish(exit_state(status));
        }
        Ok(self.state())
    }

    /// Poll for exit without waiting.
    pub fn try_wait(&self) -> Result<ProcessState> {
        let state = self.state();
        if state.is_finished() {
            return Ok(state);
        }

        // A waiter holds the lock; it will record the exit.
        let Ok(mut guard) = self.child.try_lock() else {
            return Ok(state);
        };
        if let Some(child) = guard.as_mut()
            && let Some(status) = child
                .try_wait()
                .map_err(|e| Error::io(format!("polling process {}", self.pid), e))?
        {
            *guard = None;
            self.finish(exit_state(status));
        }
        Ok(self.state())
    }

    /// Send `signal`. Invalid signals fail even if the process has exited;
    /// signalling an exited process is a no-op.
    pub fn kill(&self, signal: i32) -> Result<()> {
        let signal = to_signal(signal)?;
        // Reap first so a recycled pid is never signalled.
        if self.try_wait()?.is_finished() {
            return Ok(());
        }

        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Signal {
                pid: self.pid,
                source: io::Error::from(e),
            }),
        }
    }

    fn finish(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        debug!(id = %self.id, pid = self.pid, %state, "process reaped");
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

fn exit_state(status: std::process::ExitStatus) -> ProcessState {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessState::Exited(code),
        (None, Some(signal)) => ProcessState::Signaled(signal),
        (None, None) => ProcessState::Exited(-1),
    }
}

/// Shape of a launched plan.
#[derive(Debug)]
pub(crate) enum Node {
    Child(Arc<ChildProcess>),
    Pipeline(Vec<Node>),
    Parallel(Vec<Node>),
}

impl Node {
    fn for_each_child<'a>(&'a self, f: &mut impl FnMut(&'a Arc<ChildProcess>)) {
        match self {
            Node::Child(child) => f(child),
            Node::Pipeline(nodes) | Node::Parallel(nodes) => {
                for node in nodes {
                    node.for_each_child(f);
                }
            }
        }
    }

    fn status(&self) -> Status {
        match self {
            Node::Child(child) => child.status(),
            // Only the last stage decides.
            Node::Pipeline(stages) => match stages.last() {
                Some(last) => last.status(),
                None => Status::new(ProcessState::Exited(0), true),
            },
            Node::Parallel(members) => {
                let statuses: Vec<Status> = members.iter().map(Node::status).collect();
                match statuses.iter().find(|s| !s.success) {
                    Some(failed) => *failed,
                    None => statuses
                        .last()
                        .copied()
                        .unwrap_or(Status::new(ProcessState::Exited(0), true)),
                }
            }
        }
    }
}

/// A running (or finished) command, pipeline, or parallel group.
#[derive(Debug)]
pub struct Process {
    id: ProcessId,
    description: String,
    tree: Node,
    pipes: Vec<Arc<PipeStream>>,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        description: String,
        tree: Node,
        pipes: Vec<Arc<PipeStream>>,
    ) -> Self {
        Self {
            id,
            description,
            tree,
            pipes,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The plan this process was launched from, as a command line.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Every OS process, in launch order.
    pub fn children(&self) -> Vec<Arc<ChildProcess>> {
        let mut out = Vec::new();
        self.tree.for_each_child(&mut |c| out.push(Arc::clone(c)));
        out
    }

    /// OS process ids, in launch order.
    pub fn pids(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.tree.for_each_child(&mut |c| out.push(c.pid()));
        out
    }

    /// Caller-supplied pipe streams wired into this process.
    pub fn pipes(&self) -> &[Arc<PipeStream>] {
        &self.pipes
    }

    /// Aggregate status as of now. Running children count as failed.
    pub fn status_now(&self) -> Status {
        self.tree.status()
    }

    /// Wait for every child to exit, then aggregate.
    ///
    /// Repeatable: later calls return the recorded status.
    pub async fn wait(&self) -> Result<Status> {
        for child in self.children() {
            child.wait().await?;
        }
        Ok(self.tree.status())
    }

    /// Aggregate status if every child has exited, else `None`.
    pub fn try_status(&self) -> Result<Option<Status>> {
        let mut done = true;
        for child in self.children() {
            done &= child.try_wait()?.is_finished();
        }
        Ok(done.then(|| self.tree.status()))
    }

    pub fn is_finished(&self) -> bool {
        self.children().iter().all(|c| c.state().is_finished())
    }

    /// Signal every child that is still running.
    ///
    /// Every child is attempted; the first delivery failure is returned.
    pub fn kill(&self, signal: i32) -> Result<()> {
        to_signal(signal)?;
        let mut first_error = None;
        for child in self.children() {
            if let Err(e) = child.kill(signal) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fail with [`Error::Failed`] unless `status` is a success.
    pub(crate) fn check(&self, status: Status) -> Result<Status> {
        if status.success() {
            Ok(status)
        } else {
            Err(Error::Failed {
                command: self.description.clone(),
                status,
            })
        }
    }
}

impl std::fmt::Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.id, self.description)
    }
}
