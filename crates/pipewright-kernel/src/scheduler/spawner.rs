//! Launching plans as OS processes.
//!
//! Spawning runs in phases so that caller mistakes never leave half a
//! pipeline running:
//!
//! 1. validate the whole plan
//! 2. resolve every program
//! 3. wire stdio: create inter-stage pipes and settle each child's slots
//! 4. launch children in order
//! 5. release the parent's copies of every end handed to a child
//!
//! Phases 1 to 3 touch no process. If phase 4 fails part-way, the children
//! already started are killed and reaped before the error is returned.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use pipewright_types::{Error, ProcessId, ProcessInfo, Result, Status};
use tokio::process::Command as OsCommand;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{SpawnerConfig, StdinPolicy};
use crate::plan::{FileMode, InheritedHandle, Plan, PlanKind, Redirect, Redirects};
use crate::which::Resolver;

use super::handoff::{ProcessReceiver, handoff};
use super::limits::{fd_error, is_exhaustion};
use super::pipe_stream::{PipeStream, Side};
use super::process::{ChildProcess, Node, Process};
use super::registry::Registry;
use super::signal::to_signal;

/// Whether a spawn call returns at once or after every child has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpawnMode {
    #[default]
    Background,
    Wait,
}

/// Which stdio slot a redirect fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

impl Slot {
    fn pipe_side(self) -> Side {
        match self {
            Slot::Stdin => Side::Read,
            Slot::Stdout | Slot::Stderr => Side::Write,
        }
    }
}

/// One child, ready to launch.
struct LaunchSpec<'a> {
    command: &'a Command,
    path: PathBuf,
    stdio: Redirects,
}

/// Where each launched child sits in the plan.
enum Shape {
    Child(usize),
    Pipeline(Vec<Shape>),
    Parallel(Vec<Shape>),
}

/// Parent-side state of one spawn call, cleaned up on every exit path.
#[derive(Default)]
struct Launch {
    /// Inter-stage links, closed entirely once children hold their ends.
    links: Vec<Arc<PipeStream>>,
    /// Caller pipe ends handed to children.
    handed: Vec<(Arc<PipeStream>, Side)>,
    children: Vec<Arc<ChildProcess>>,
}

impl Launch {
    fn hand(&mut self, pipe: &Arc<PipeStream>, side: Side) {
        let seen = self
            .handed
            .iter()
            .any(|(p, s)| Arc::ptr_eq(p, pipe) && *s == side);
        if !seen {
            self.handed.push((Arc::clone(pipe), side));
        }
    }

    fn is_link(&self, pipe: &Arc<PipeStream>) -> bool {
        self.links.iter().any(|l| Arc::ptr_eq(l, pipe))
    }

    /// Drop the parent's copies of everything children now hold.
    async fn release(&mut self) {
        for (pipe, side) in self.handed.drain(..) {
            pipe.release(side).await;
        }
        for link in self.links.drain(..) {
            link.close().await;
        }
    }

    /// Kill and reap children started before a failure.
    async fn abort(&mut self) {
        for child in &self.children {
            let _ = child.kill(nix::sys::signal::Signal::SIGKILL as i32);
        }
        for child in &self.children {
            let _ = child.wait().await;
        }
        self.release().await;
    }
}

/// Launches plans and tracks the processes it started.
pub struct Spawner {
    config: SpawnerConfig,
    resolver: Resolver,
    registry: Arc<Registry>,
}

impl Spawner {
    pub fn new(config: SpawnerConfig) -> Self {
        let resolver = Resolver::new(config.resolver.clone());
        Self {
            config,
            resolver,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Launch `plan` in the background with default stdio.
    pub async fn spawn(&self, plan: impl Into<Plan>) -> Result<Process> {
        self.spawn_with(plan.into(), Redirects::default(), SpawnMode::Background)
            .await
    }

    /// Launch `plan` with top-level redirections.
    ///
    /// `redirects` apply where the plan itself leaves a slot unset. With
    /// [`SpawnMode::Wait`] this returns once every child has exited.
    #[tracing::instrument(level = "debug", skip_all, fields(spawner = %self.config.name, plan = %plan))]
    pub async fn spawn_with(&self, plan: Plan, redirects: Redirects, mode: SpawnMode) -> Result<Process> {
        plan.validate()?;
        redirects.validate()?;

        let paths = plan
            .commands()
            .into_iter()
            .map(|cmd| self.resolve(cmd))
            .collect::<Result<Vec<_>>>()?;

        let mut launch = Launch::default();
        let mut specs = Vec::with_capacity(paths.len());
        let mut paths = paths.into_iter();
        let shape = match wire(&plan, &redirects, &mut paths, &mut specs, &mut launch) {
            Ok(shape) => shape,
            Err(e) => {
                launch.release().await;
                return Err(e);
            }
        };

        let owner = self.registry.next_id();
        for spec in &specs {
            match self.launch_one(owner, spec, &mut launch).await {
                Ok(child) => launch.children.push(child),
                Err(e) => {
                    warn!(error = %e, started = launch.children.len(), "spawn failed part-way, cleaning up");
                    launch.abort().await;
                    return Err(e);
                }
            }
        }
        launch.release().await;

        let pipes = collect_caller_pipes(&plan, &redirects);
        let tree = build_tree(shape, &launch.children);
        let process = Process::new(owner, plan.to_string(), tree, pipes);
        if mode == SpawnMode::Wait {
            process.wait().await?;
        }
        Ok(process)
    }

    /// Wait for `plan` and fail unless it succeeds.
    pub async fn run(&self, plan: impl Into<Plan>) -> Result<Status> {
        let process = self.spawn(plan).await?;
        let status = process.wait().await?;
        process.check(status)
    }

    /// Wait for `plan` and return its status, success or not.
    pub async fn status(&self, plan: impl Into<Plan>) -> Result<Status> {
        self.spawn(plan).await?.wait().await
    }

    /// Run `plan` and capture its stdout. Fails like [`run`](Self::run).
    pub async fn read(&self, plan: impl Into<Plan>) -> Result<Vec<u8>> {
        let pipe = PipeStream::shared()?;
        let redirects = Redirects::default().stdout(Redirect::pipe(&pipe));
        let process = self
            .spawn_with(plan.into(), redirects, SpawnMode::Background)
            .await?;
        // The plan may redirect its own stdout elsewhere; EOF must still come.
        pipe.close_write().await;

        let (output, status) = tokio::join!(pipe.read_to_end(), process.wait());
        let status = status?;
        let output = output?;
        process.check(status)?;
        Ok(output)
    }

    pub async fn read_to_string(&self, plan: impl Into<Plan>) -> Result<String> {
        let bytes = self.read(plan).await?;
        String::from_utf8(bytes).map_err(|e| {
            Error::io(
                "decoding process output",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Spawn on a background task, handing the process over when ready.
    ///
    /// If the receiver is dropped first, the task waits for the process
    /// itself so nothing is left unreaped.
    pub fn spawn_task(self: &Arc<Self>, plan: impl Into<Plan>, redirects: Redirects) -> ProcessReceiver {
        let (tx, rx) = handoff();
        let spawner = Arc::clone(self);
        let plan = plan.into();
        tokio::spawn(async move {
            let outcome = spawner
                .spawn_with(plan, redirects, SpawnMode::Background)
                .await;
            if let Err(Ok(process)) = tx.send(outcome) {
                debug!(id = %process.id(), "handoff receiver gone, reaping");
                let _ = process.wait().await;
            }
        });
        rx
    }

    // ── Registry ─────────────────────────────────────────────────────────

    /// Children that have not been reaped, in launch order.
    pub fn live(&self) -> Vec<ProcessInfo> {
        self.registry.snapshot().iter().map(|c| c.info()).collect()
    }

    pub fn get(&self, id: ProcessId) -> Option<ProcessInfo> {
        self.registry.get(id).map(|c| c.info())
    }

    /// Wait for every live child. Returns their final states.
    pub async fn wait_all(&self) -> Result<Vec<ProcessInfo>> {
        let mut done = Vec::new();
        for child in self.registry.snapshot() {
            child.wait().await?;
            done.push(child.info());
        }
        Ok(done)
    }

    /// Signal every live child. Every child is attempted; the first
    /// delivery failure is returned.
    pub fn kill_all(&self, signal: i32) -> Result<()> {
        to_signal(signal)?;
        let mut first_error = None;
        for child in self.registry.snapshot() {
            if let Err(e) = child.kill(signal) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reap children that have exited, without waiting. Returns them.
    pub fn reap(&self) -> Result<Vec<ProcessInfo>> {
        let mut reaped = Vec::new();
        for child in self.registry.snapshot() {
            if child.try_wait()?.is_finished() {
                reaped.push(child.info());
            }
        }
        Ok(reaped)
    }

    // ── Launching ────────────────────────────────────────────────────────

    fn resolve(&self, cmd: &Command) -> Result<PathBuf> {
        match cmd.path_override() {
            Some(path) => self.resolver.which_in(cmd.program(), path),
            None => self.resolver.which(cmd.program()),
        }
    }

    async fn launch_one(
        &self,
        owner: ProcessId,
        spec: &LaunchSpec<'_>,
        launch: &mut Launch,
    ) -> Result<Arc<ChildProcess>> {
        let cmd = spec.command;
        let mut os = OsCommand::new(&spec.path);
        os.arg0(cmd.program())
            .args(cmd.get_args())
            .kill_on_drop(false);

        let env = cmd.get_env();
        if env.clear {
            os.env_clear();
        }
        for (key, value) in &env.vars {
            match value {
                Some(value) => os.env(key, value),
                None => os.env_remove(key),
            };
        }

        if let Some(dir) = cmd.get_dir().or(self.config.default_dir.as_deref()) {
            os.current_dir(dir);
        }
        if cmd.is_detached() {
            os.process_group(0);
        }

        os.stdin(self.materialize(Slot::Stdin, &spec.stdio.stdin, launch).await?);
        os.stdout(self.materialize(Slot::Stdout, &spec.stdio.stdout, launch).await?);
        os.stderr(self.materialize(Slot::Stderr, &spec.stdio.stderr, launch).await?);

        let child = os.spawn().map_err(|e| {
            if is_exhaustion(&e) {
                fd_error(format!("launching {}", cmd.program()), e)
            } else {
                Error::Spawn {
                    program: cmd.program().to_string(),
                    source: e,
                }
            }
        })?;

        let child = Arc::new(ChildProcess::new(
            self.registry.next_id(),
            owner,
            cmd.to_string(),
            cmd.ignores_status(),
            child,
            Arc::downgrade(&self.registry),
        ));
        self.registry.insert(Arc::clone(&child));
        debug!(id = %child.id(), pid = child.pid(), program = cmd.program(), "launched");
        Ok(child)
    }

    /// Turn one redirect into a stdio handle for a child.
    async fn materialize(
        &self,
        slot: Slot,
        target: &Option<Redirect>,
        launch: &mut Launch,
    ) -> Result<std::process::Stdio> {
        let Some(target) = target else {
            return Ok(match (slot, self.config.stdin) {
                (Slot::Stdin, StdinPolicy::Null) => std::process::Stdio::null(),
                _ => std::process::Stdio::inherit(),
            });
        };

        match target {
            Redirect::File(file) => {
                let opened = match file.mode {
                    FileMode::Read => File::open(&file.path),
                    FileMode::Truncate => OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&file.path),
                    FileMode::Append => OpenOptions::new().append(true).create(true).open(&file.path),
                };
                let file = opened.map_err(|e| fd_error(format!("opening {}", file.path.display()), e))?;
                Ok(file.into())
            }
            Redirect::Pipe(pipe) => {
                let side = slot.pipe_side();
                let fd = pipe.child_end(side).await?;
                if !launch.is_link(pipe) {
                    launch.hand(pipe, side);
                }
                Ok(fd.into())
            }
            Redirect::Inherit(InheritedHandle::Parent) => Ok(std::process::Stdio::inherit()),
            Redirect::Inherit(InheritedHandle::Fd(fd)) => {
                let dup = fd
                    .try_clone()
                    .map_err(|e| fd_error("duplicating an inherited handle", e))?;
                Ok(dup.into())
            }
            Redirect::Discard => Ok(std::process::Stdio::null()),
        }
    }
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("name", &self.config.name)
            .field("live", &self.registry.len())
            .finish()
    }
}

/// Settle every child's stdio, creating inter-stage links.
///
/// A node's own redirects win over what its parent wires in. Pipeline
/// stages get links between them; parallel members share the group's
/// stdio.
fn wire<'a>(
    plan: &'a Plan,
    outer: &Redirects,
    paths: &mut impl Iterator<Item = PathBuf>,
    specs: &mut Vec<LaunchSpec<'a>>,
    launch: &mut Launch,
) -> Result<Shape> {
    let stdio = plan.redirects().or(outer);
    match plan.kind() {
        PlanKind::Command(command) => {
            let path = paths.next().ok_or(Error::EmptyProgram)?;
            specs.push(LaunchSpec {
                command,
                path,
                stdio,
            });
            Ok(Shape::Child(specs.len() - 1))
        }
        PlanKind::Pipeline(stages) => {
            let mut shapes = Vec::with_capacity(stages.len());
            let mut upstream: Option<Arc<PipeStream>> = None;
            for (i, stage) in stages.iter().enumerate() {
                let mut wiring = stdio.clone();
                if let Some(link) = upstream.take() {
                    wiring.stdin = Some(Redirect::Pipe(link));
                }
                if i + 1 < stages.len() {
                    let link = PipeStream::shared()?;
                    launch.links.push(Arc::clone(&link));
                    wiring.stdout = Some(Redirect::Pipe(Arc::clone(&link)));
                    upstream = Some(link);
                }
                shapes.push(wire(stage, &wiring, paths, specs, launch)?);
            }
            Ok(Shape::Pipeline(shapes))
        }
        PlanKind::Parallel(members) => {
            let mut shapes = Vec::with_capacity(members.len());
            for member in members {
                shapes.push(wire(member, &stdio, paths, specs, launch)?);
            }
            Ok(Shape::Parallel(shapes))
        }
    }
}

fn build_tree(shape: Shape, children: &[Arc<ChildProcess>]) -> Node {
    match shape {
        Shape::Child(i) => Node::Child(Arc::clone(&children[i])),
        Shape::Pipeline(shapes) => {
            Node::Pipeline(shapes.into_iter().map(|s| build_tree(s, children)).collect())
        }
        Shape::Parallel(shapes) => {
            Node::Parallel(shapes.into_iter().map(|s| build_tree(s, children)).collect())
        }
    }
}

fn collect_caller_pipes(plan: &Plan, redirects: &Redirects) -> Vec<Arc<PipeStream>> {
    let mut pipes: Vec<Arc<PipeStream>> = Vec::new();
    let mut add = |p: &Arc<PipeStream>| {
        if !pipes.iter().any(|q| Arc::ptr_eq(p, q)) {
            pipes.push(Arc::clone(p));
        }
    };
    redirects.pipes().for_each(&mut add);
    visit_redirects(plan, &mut |r| r.pipes().for_each(&mut add));
    pipes
}

fn visit_redirects(plan: &Plan, f: &mut impl FnMut(&Redirects)) {
    f(plan.redirects());
    if let PlanKind::Pipeline(nodes) | PlanKind::Parallel(nodes) = plan.kind() {
        for node in nodes {
            visit_redirects(node, f);
        }
    }
}
