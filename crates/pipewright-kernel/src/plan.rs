//! Composing commands into pipelines and parallel groups.
//!
//! A [`Plan`] is a tree: leaves are [`Command`]s, inner nodes are
//! pipelines (`a | b`) or parallel groups (`a & b`). Every node may carry
//! its own stdio redirections, which take precedence over whatever its
//! parent wires in.
//!
//! ```
//! use pipewright_kernel::{Command, Plan, Redirect};
//!
//! let plan = (Command::new("cat").arg("log.txt") | Command::new("sort") | Command::new("uniq"))
//!     .stdout(Redirect::truncate("out.txt"));
//! assert_eq!(plan.to_string(), "(cat log.txt | sort | uniq) > out.txt");
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use pipewright_types::{Error, Result};

use crate::command::{Command, check_path_nul};
use crate::scheduler::PipeStream;

/// How a redirected file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Truncate,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub path: PathBuf,
    pub mode: FileMode,
}

/// A handle inherited from the parent.
#[derive(Debug, Clone)]
pub enum InheritedHandle {
    /// The parent's own stdin, stdout or stderr, matching the slot.
    Parent,
    /// A specific descriptor, duplicated for each child.
    Fd(Arc<OwnedFd>),
}

impl PartialEq for InheritedHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (InheritedHandle::Parent, InheritedHandle::Parent) => true,
            (InheritedHandle::Fd(a), InheritedHandle::Fd(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Where one stdio slot of a child goes.
#[derive(Debug, Clone)]
pub enum Redirect {
    File(FileTarget),
    /// The read end for stdin, the write end for stdout and stderr.
    Pipe(Arc<PipeStream>),
    Inherit(InheritedHandle),
    /// The null device.
    Discard,
}

impl Redirect {
    /// Read stdin from a file.
    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self::file(path, FileMode::Read)
    }

    /// Write to a file, truncating it.
    pub fn truncate(path: impl Into<PathBuf>) -> Self {
        Self::file(path, FileMode::Truncate)
    }

    /// Write to a file, appending.
    pub fn append(path: impl Into<PathBuf>) -> Self {
        Self::file(path, FileMode::Append)
    }

    pub fn file(path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Redirect::File(FileTarget {
            path: path.into(),
            mode,
        })
    }

    /// Connect a slot to `stream`.
    ///
    /// Once the spawn launches, the parent's copy of the end handed over
    /// is closed so the child's exit brings EOF or a broken pipe. The
    /// stream keeps its other end, but the handed end cannot be given to
    /// a later spawn: that fails with [`Error::WriteClosed`] for an output
    /// pipe. Share one stream between children within a single plan.
    ///
    /// [`Error::WriteClosed`]: pipewright_types::Error::WriteClosed
    pub fn pipe(stream: &Arc<PipeStream>) -> Self {
        Redirect::Pipe(Arc::clone(stream))
    }

    pub fn inherit() -> Self {
        Redirect::Inherit(InheritedHandle::Parent)
    }

    pub fn fd(fd: OwnedFd) -> Self {
        Redirect::Inherit(InheritedHandle::Fd(Arc::new(fd)))
    }

    pub fn discard() -> Self {
        Redirect::Discard
    }

    fn validate(&self) -> Result<()> {
        match self {
            Redirect::File(target) => check_path_nul("redirect path", &target.path),
            _ => Ok(()),
        }
    }
}

impl PartialEq for Redirect {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Redirect::File(a), Redirect::File(b)) => a == b,
            (Redirect::Pipe(a), Redirect::Pipe(b)) => Arc::ptr_eq(a, b),
            (Redirect::Inherit(a), Redirect::Inherit(b)) => a == b,
            (Redirect::Discard, Redirect::Discard) => true,
            _ => false,
        }
    }
}

/// Stdio redirections for one node. `None` defers to the parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Redirects {
    pub stdin: Option<Redirect>,
    pub stdout: Option<Redirect>,
    pub stderr: Option<Redirect>,
}

impl Redirects {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }

    /// These redirections, falling back to `outer` for unset slots.
    pub fn or(&self, outer: &Redirects) -> Redirects {
        Redirects {
            stdin: self.stdin.clone().or_else(|| outer.stdin.clone()),
            stdout: self.stdout.clone().or_else(|| outer.stdout.clone()),
            stderr: self.stderr.clone().or_else(|| outer.stderr.clone()),
        }
    }

    pub fn stdin(mut self, target: Redirect) -> Self {
        self.stdin = Some(target);
        self
    }

    pub fn stdout(mut self, target: Redirect) -> Self {
        self.stdout = Some(target);
        self
    }

    pub fn stderr(mut self, target: Redirect) -> Self {
        self.stderr = Some(target);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for target in [&self.stdin, &self.stdout, &self.stderr].into_iter().flatten() {
            target.validate()?;
        }
        Ok(())
    }

    /// Pipe streams referenced by these redirections.
    pub(crate) fn pipes(&self) -> impl Iterator<Item = &Arc<PipeStream>> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .filter_map(|r| match r {
                Some(Redirect::Pipe(p)) => Some(p),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    Command(Command),
    /// Stages connected stdout to stdin.
    Pipeline(Vec<Plan>),
    /// Members run side by side, sharing the group's stdio.
    Parallel(Vec<Plan>),
}

/// A command, pipeline or parallel group, with redirections.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    kind: PlanKind,
    redirects: Redirects,
}

impl Plan {
    fn node(kind: PlanKind) -> Self {
        Self {
            kind,
            redirects: Redirects::default(),
        }
    }

    /// Chain plans stdout to stdin. Fails on an empty collection.
    pub fn pipeline<I, P>(stages: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<Plan>,
    {
        fold(stages, "pipeline", |a, b| a | b)
    }

    /// Run plans side by side. Fails on an empty collection.
    pub fn parallel<I, P>(members: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<Plan>,
    {
        fold(members, "parallel group", |a, b| a & b)
    }

    pub fn kind(&self) -> &PlanKind {
        &self.kind
    }

    pub fn redirects(&self) -> &Redirects {
        &self.redirects
    }

    pub fn stdin(mut self, target: Redirect) -> Self {
        self.redirects.stdin = Some(target);
        self
    }

    pub fn stdout(mut self, target: Redirect) -> Self {
        self.redirects.stdout = Some(target);
        self
    }

    pub fn stderr(mut self, target: Redirect) -> Self {
        self.redirects.stderr = Some(target);
        self
    }

    /// The commands in this plan, in launch order.
    pub fn commands(&self) -> Vec<&Command> {
        let mut out = Vec::new();
        self.collect_commands(&mut out);
        out
    }

    fn collect_commands<'a>(&'a self, out: &mut Vec<&'a Command>) {
        match &self.kind {
            PlanKind::Command(cmd) => out.push(cmd),
            PlanKind::Pipeline(nodes) | PlanKind::Parallel(nodes) => {
                for node in nodes {
                    node.collect_commands(out);
                }
            }
        }
    }

    /// Validate every command and redirection in the tree.
    pub fn validate(&self) -> Result<()> {
        self.redirects.validate()?;
        match &self.kind {
            PlanKind::Command(cmd) => cmd.validate(),
            PlanKind::Pipeline(nodes) if nodes.is_empty() => Err(Error::EmptyPlan("pipeline")),
            PlanKind::Parallel(nodes) if nodes.is_empty() => Err(Error::EmptyPlan("parallel group")),
            PlanKind::Pipeline(nodes) | PlanKind::Parallel(nodes) => {
                nodes.iter().try_for_each(Plan::validate)
            }
        }
    }

    /// Stages of this plan as a pipeline, for flattening `|`.
    fn into_stages(self) -> Vec<Plan> {
        match self.kind {
            PlanKind::Pipeline(stages) if self.redirects.is_empty() => stages,
            kind => vec![Plan {
                kind,
                redirects: self.redirects,
            }],
        }
    }

    /// Members of this plan as a group, for flattening `&`.
    fn into_members(self) -> Vec<Plan> {
        match self.kind {
            PlanKind::Parallel(members) if self.redirects.is_empty() => members,
            kind => vec![Plan {
                kind,
                redirects: self.redirects,
            }],
        }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        let wrap = match &self.kind {
            PlanKind::Command(_) => false,
            PlanKind::Pipeline(_) => nested || !self.redirects.is_empty(),
            PlanKind::Parallel(_) => true,
        };
        if wrap {
            f.write_str("(")?;
        }
        match &self.kind {
            PlanKind::Command(cmd) => write!(f, "{}", cmd)?,
            PlanKind::Pipeline(nodes) => fmt_joined(f, nodes, " | ")?,
            PlanKind::Parallel(nodes) => fmt_joined(f, nodes, " & ")?,
        }
        if wrap {
            f.write_str(")")?;
        }
        fmt_redirect(f, "<", &self.redirects.stdin, 0)?;
        fmt_redirect(f, ">", &self.redirects.stdout, 1)?;
        fmt_redirect(f, "2>", &self.redirects.stderr, 2)
    }
}

fn fold<I, P>(items: I, what: &'static str, join: impl Fn(Plan, Plan) -> Plan) -> Result<Plan>
where
    I: IntoIterator<Item = P>,
    P: Into<Plan>,
{
    let mut items = items.into_iter().map(Into::into);
    let first = items.next().ok_or(Error::EmptyPlan(what))?;
    Ok(items.fold(first, join))
}

fn fmt_joined(f: &mut fmt::Formatter<'_>, nodes: &[Plan], sep: &str) -> fmt::Result {
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        node.fmt_node(f, true)?;
    }
    Ok(())
}

fn fmt_redirect(f: &mut fmt::Formatter<'_>, op: &str, target: &Option<Redirect>, slot: i32) -> fmt::Result {
    let Some(target) = target else {
        return Ok(());
    };
    match target {
        Redirect::File(FileTarget { path, mode }) => {
            let op = match (mode, slot) {
                (FileMode::Append, 2) => "2>>",
                (FileMode::Append, _) => ">>",
                _ => op,
            };
            let path = path.display().to_string();
            write!(f, " {} {}", op, crate::escape::escape([path]))
        }
        Redirect::Pipe(stream) => write!(f, " {} {}", op, stream),
        Redirect::Inherit(InheritedHandle::Parent) => Ok(()),
        Redirect::Inherit(InheritedHandle::Fd(fd)) => write!(f, " {}&{}", op, fd.as_raw_fd()),
        Redirect::Discard => write!(f, " {} /dev/null", op),
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, false)
    }
}

impl From<Command> for Plan {
    fn from(cmd: Command) -> Self {
        Plan::node(PlanKind::Command(cmd))
    }
}

impl<T: Into<Plan>> BitOr<T> for Plan {
    type Output = Plan;

    fn bitor(self, rhs: T) -> Plan {
        let mut stages = self.into_stages();
        stages.extend(rhs.into().into_stages());
        Plan::node(PlanKind::Pipeline(stages))
    }
}

impl<T: Into<Plan>> BitOr<T> for Command {
    type Output = Plan;

    fn bitor(self, rhs: T) -> Plan {
        Plan::from(self) | rhs
    }
}

impl<T: Into<Plan>> BitAnd<T> for Plan {
    type Output = Plan;

    fn bitand(self, rhs: T) -> Plan {
        let mut members = self.into_members();
        members.extend(rhs.into().into_members());
        Plan::node(PlanKind::Parallel(members))
    }
}

impl<T: Into<Plan>> BitAnd<T> for Command {
    type Output = Plan;

    fn bitand(self, rhs: T) -> Plan {
        Plan::from(self) & rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str) -> Command {
        Command::new(name)
    }

    #[test]
    fn test_pipe_is_associative() {
        let left = (cmd("a") | cmd("b")) | cmd("c");
        let right = cmd("a") | (cmd("b") | cmd("c"));
        assert_eq!(left, right);
        match left.kind() {
            PlanKind::Pipeline(stages) => assert_eq!(stages.len(), 3),
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_parallel_is_associative() {
        let left = (cmd("a") & cmd("b")) & cmd("c");
        let right = cmd("a") & (cmd("b") & cmd("c"));
        assert_eq!(left, right);
        assert_eq!(left.to_string(), "(a & b & c)");
    }

    #[test]
    fn test_mixed_nesting_display() {
        let plan = (cmd("a") & cmd("b")) | cmd("c");
        assert_eq!(plan.to_string(), "(a & b) | c");
        assert_eq!(plan.commands().len(), 3);
    }

    #[test]
    fn test_redirected_node_is_not_flattened() {
        let inner = (cmd("a") | cmd("b")).stderr(Redirect::discard());
        let plan = inner | cmd("c");
        match plan.kind() {
            PlanKind::Pipeline(stages) => assert_eq!(stages.len(), 2),
            other => panic!("unexpected plan: {other:?}"),
        }
        assert_eq!(plan.to_string(), "(a | b) 2> /dev/null | c");
    }

    #[test]
    fn test_redirect_display() {
        let plan = Plan::from(cmd("sort"))
            .stdin(Redirect::read("in file.txt"))
            .stdout(Redirect::append("out.txt"))
            .stderr(Redirect::append("err.txt"));
        assert_eq!(
            plan.to_string(),
            "sort < 'in file.txt' >> out.txt 2>> err.txt"
        );
    }

    #[test]
    fn test_fold_constructors() {
        assert!(matches!(
            Plan::pipeline(Vec::<Command>::new()),
            Err(Error::EmptyPlan("pipeline"))
        ));
        assert!(matches!(
            Plan::parallel(Vec::<Plan>::new()),
            Err(Error::EmptyPlan("parallel group"))
        ));

        let single = Plan::pipeline([cmd("only")]).unwrap();
        assert_eq!(single, Plan::from(cmd("only")));

        let piped = Plan::pipeline([cmd("a"), cmd("b")]).unwrap();
        assert_eq!(piped, cmd("a") | cmd("b"));
    }

    #[test]
    fn test_validate_walks_tree() {
        let plan = cmd("ok") | (cmd("fine") & cmd(""));
        assert!(matches!(plan.validate(), Err(Error::EmptyProgram)));

        let plan = Plan::from(cmd("cat")).stdin(Redirect::read("a\0b"));
        assert!(matches!(plan.validate(), Err(Error::NulByte { .. })));
    }

    #[test]
    fn test_redirect_equality() {
        let pipe = PipeStream::shared().unwrap();
        assert_eq!(Redirect::pipe(&pipe), Redirect::pipe(&pipe));
        assert_ne!(Redirect::pipe(&pipe), Redirect::pipe(&PipeStream::shared().unwrap()));
        assert_eq!(Redirect::truncate("x"), Redirect::truncate("x"));
        assert_ne!(Redirect::truncate("x"), Redirect::append("x"));
        assert_eq!(Redirect::inherit(), Redirect::inherit());
    }
}
