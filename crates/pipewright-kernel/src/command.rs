//! A single program invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pipewright_types::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::escape::escape;
use crate::lexer;

/// Environment overrides for a command.
///
/// Without `clear`, `vars` is merged onto the inherited environment: a
/// `Some` value sets a variable, `None` removes it. With `clear`, the
/// child sees only the `Some` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    pub clear: bool,
    pub vars: BTreeMap<String, Option<String>>,
}

impl Env {
    /// The effective value of `key` if this override decides it.
    ///
    /// Returns `None` when the inherited environment decides.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        match self.vars.get(key) {
            Some(value) => Some(value.as_deref()),
            None if self.clear => Some(None),
            None => None,
        }
    }
}

/// One program invocation: the program, its arguments, and how to run it.
///
/// Commands are values. Builder methods consume and return `self`, so a
/// command is never changed behind a caller's back, and two commands are
/// equal when every field is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    program: String,
    args: Vec<String>,
    env: Env,
    dir: Option<PathBuf>,
    ignore_status: bool,
    detach: bool,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Env::default(),
            dir: None,
            ignore_status: false,
            detach: false,
        }
    }

    /// Build a command from a shell-quoted line.
    ///
    /// ```
    /// use pipewright_kernel::Command;
    ///
    /// let cmd = Command::parse("grep -n 'fn main' src/main.rs").unwrap();
    /// assert_eq!(cmd.program(), "grep");
    /// assert_eq!(cmd.get_args(), ["-n", "fn main", "src/main.rs"]);
    /// ```
    pub fn parse(line: &str) -> Result<Self> {
        Self::from_argv(lexer::split(line)?)
    }

    /// Build a command from a full argument vector, program first.
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().ok_or(Error::EmptyProgram)?;
        Ok(Self::new(program).args(argv))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.vars.insert(key.into(), Some(value.into()));
        self
    }

    /// Remove an inherited environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.vars.insert(key.into(), None);
        self
    }

    /// Replace the whole environment.
    pub fn full_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Env {
            clear: true,
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        };
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Treat any exit status as success.
    pub fn ignore_status(mut self) -> Self {
        self.ignore_status = true;
        self
    }

    /// Run the child in its own process group.
    pub fn detach(mut self) -> Self {
        self.detach = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &Env {
        &self.env
    }

    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn ignores_status(&self) -> bool {
        self.ignore_status
    }

    pub fn is_detached(&self) -> bool {
        self.detach
    }

    /// Number of argv entries, program included.
    pub fn len(&self) -> usize {
        1 + self.args.len()
    }

    /// Always false: argv holds at least the program.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Argv entry `index`, where 0 is the program.
    pub fn get(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(&self.program),
            n => self.args.get(n - 1).map(String::as_str),
        }
    }

    /// Iterate over argv, program first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// The `PATH` this command will run with, when it overrides it.
    pub fn path_override(&self) -> Option<&str> {
        self.env.get("PATH").flatten()
    }

    /// Check every field for problems the OS would reject.
    ///
    /// Runs before anything is launched, so a bad command never leaves
    /// half a pipeline behind.
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(Error::EmptyProgram);
        }
        Error::check_nul(|| "program".to_string(), &self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            Error::check_nul(|| format!("argument {}", i + 1), arg)?;
        }
        for (key, value) in &self.env.vars {
            if key.is_empty() || key.contains('=') {
                return Err(Error::InvalidEnvName(key.clone()));
            }
            Error::check_nul(|| "environment name".to_string(), key)?;
            if let Some(value) = value {
                Error::check_nul(|| format!("environment value of {key}"), value)?;
            }
        }
        if let Some(dir) = &self.dir {
            check_path_nul("working directory", dir)?;
        }
        Ok(())
    }
}

/// Reject paths with interior NUL bytes.
pub(crate) fn check_path_nul(field: &str, path: &Path) -> Result<()> {
    let text = path.as_os_str().to_string_lossy();
    Error::check_nul(|| field.to_string(), &text)
}

impl std::ops::Index<usize> for Command {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        match index {
            0 => &self.program,
            n => &self.args[n - 1],
        }
    }
}

impl<'a> IntoIterator for &'a Command {
    type Item = &'a str;
    type IntoIter = Box<dyn Iterator<Item = &'a str> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&escape(self.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_do_not_share_state() {
        let base = Command::new("ls").arg("-l");
        let extended = base.clone().arg("/tmp");
        assert_eq!(base.get_args(), ["-l"]);
        assert_eq!(extended.get_args(), ["-l", "/tmp"]);
        assert_ne!(base, extended);
    }

    #[test]
    fn test_structural_equality() {
        let a = Command::new("env").env("A", "1").dir("/tmp").ignore_status();
        let b = Command::new("env").env("A", "1").dir("/tmp").ignore_status();
        assert_eq!(a, b);
        assert_ne!(a, b.clone().detach());
        assert_ne!(a, Command::new("env").env("A", "2").dir("/tmp").ignore_status());
    }

    #[test]
    fn test_indexing_and_iteration() {
        let cmd = Command::new("echo").args(["a", "b c"]);
        assert_eq!(cmd.len(), 3);
        assert_eq!(&cmd[0], "echo");
        assert_eq!(&cmd[2], "b c");
        assert_eq!(cmd.get(3), None);
        let argv: Vec<&str> = (&cmd).into_iter().collect();
        assert_eq!(argv, vec!["echo", "a", "b c"]);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let cmd = Command::new("printf").args(["%s\n", "it's", ""]);
        let line = cmd.to_string();
        assert_eq!(Command::parse(&line).unwrap(), cmd);
    }

    #[test]
    fn test_from_argv_requires_program() {
        assert!(matches!(
            Command::from_argv(Vec::<String>::new()),
            Err(Error::EmptyProgram)
        ));
        assert!(matches!(Command::parse("   "), Err(Error::EmptyProgram)));
    }

    #[test]
    fn test_validate_finds_nul_bytes() {
        let err = Command::new("echo").arg("ok").arg("b\0d").validate().unwrap_err();
        match err {
            Error::NulByte { field, offset, .. } => {
                assert_eq!(field, "argument 2");
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = Command::new("env").env("K", "v\0").validate().unwrap_err();
        assert!(matches!(err, Error::NulByte { .. }));
    }

    #[test]
    fn test_validate_env_names() {
        assert!(matches!(
            Command::new("env").env("A=B", "x").validate(),
            Err(Error::InvalidEnvName(_))
        ));
        assert!(matches!(
            Command::new("env").env("", "x").validate(),
            Err(Error::InvalidEnvName(_))
        ));
        assert!(Command::new("env").env("OK", "").validate().is_ok());
    }

    #[test]
    fn test_validate_empty_program() {
        assert!(matches!(Command::new("").validate(), Err(Error::EmptyProgram)));
    }

    #[test]
    fn test_path_override() {
        let cmd = Command::new("x").env("PATH", "/opt/bin");
        assert_eq!(cmd.path_override(), Some("/opt/bin"));
        assert_eq!(Command::new("x").path_override(), None);
        assert_eq!(Command::new("x").full_env([("HOME", "/")]).path_override(), None);
        assert_eq!(Command::new("x").env_remove("PATH").path_override(), None);
    }

    #[test]
    fn test_env_overrides() {
        let cmd = Command::new("x").env("A", "1").env_remove("B");
        assert_eq!(cmd.get_env().get("A"), Some(Some("1")));
        assert_eq!(cmd.get_env().get("B"), Some(None));
        assert_eq!(cmd.get_env().get("C"), None);

        let cmd = cmd.full_env([("Z", "26")]);
        assert_eq!(cmd.get_env().get("A"), Some(None));
        assert_eq!(cmd.get_env().get("Z"), Some(Some("26")));
    }

    #[test]
    fn test_serializes() {
        let cmd = Command::new("ls").arg("-a").detach();
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
