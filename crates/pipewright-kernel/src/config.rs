//! Spawner and resolver configuration.

use std::path::PathBuf;

/// Where the current directory sits in executable lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CurrentDirPolicy {
    /// Never search the current directory for bare names.
    #[default]
    Never,
    /// Search the current directory before the search path.
    First,
    /// Search the current directory after the search path.
    Last,
}

/// How bare program names are turned into paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Directories to search, in order. Empty entries are skipped.
    pub search_path: Vec<PathBuf>,
    /// Suffixes tried after the bare name, e.g. `.sh`.
    pub extensions: Vec<String>,
    /// Current directory precedence.
    pub current_dir: CurrentDirPolicy,
}

impl ResolverConfig {
    /// Search path from the process environment. No extensions.
    pub fn from_env() -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self {
            search_path,
            extensions: Vec::new(),
            current_dir: CurrentDirPolicy::default(),
        }
    }

    /// A fixed search list, independent of the environment.
    pub fn isolated(search_path: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            search_path: search_path.into_iter().map(Into::into).collect(),
            extensions: Vec::new(),
            current_dir: CurrentDirPolicy::default(),
        }
    }

    /// Parse a `PATH`-style string into a search list, keeping this
    /// config's extensions and policy.
    pub fn with_path_str(&self, path: &str) -> Self {
        Self {
            search_path: std::env::split_paths(path).collect(),
            ..self.clone()
        }
    }

    pub fn with_extensions(mut self, extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_current_dir(mut self, policy: CurrentDirPolicy) -> Self {
        self.current_dir = policy;
        self
    }
}

/// What a child's stdin is when the plan does not say.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinPolicy {
    /// Inherit the parent's stdin.
    #[default]
    Inherit,
    /// Read from the null device.
    Null,
}

/// Configuration for a [`crate::Spawner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerConfig {
    /// Name of this spawner, used in log spans.
    pub name: String,

    /// Executable lookup rules.
    pub resolver: ResolverConfig,

    /// Working directory for commands that do not set one.
    ///
    /// `None` leaves children in the parent's current directory.
    pub default_dir: Option<PathBuf>,

    /// Default stdin for children with no explicit stdin redirect.
    pub stdin: StdinPolicy,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SpawnerConfig {
    /// Resolve programs against the environment's `PATH`, inheriting stdio.
    pub fn from_env() -> Self {
        Self {
            name: "default".to_string(),
            resolver: ResolverConfig::from_env(),
            default_dir: None,
            stdin: StdinPolicy::Inherit,
        }
    }

    /// Create a config with a fixed search path and stdin from the null
    /// device.
    ///
    /// Useful for tests and embedders that must not depend on the caller's
    /// environment or terminal.
    pub fn isolated(search_path: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            name: "isolated".to_string(),
            resolver: ResolverConfig::isolated(search_path),
            default_dir: None,
            stdin: StdinPolicy::Null,
        }
    }

    /// Set the spawner name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_default_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_dir = Some(dir.into());
        self
    }

    pub fn with_stdin(mut self, stdin: StdinPolicy) -> Self {
        self.stdin = stdin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_ignores_environment() {
        let config = SpawnerConfig::isolated(["/opt/bin", "/usr/bin"]);
        assert_eq!(config.name, "isolated");
        assert_eq!(
            config.resolver.search_path,
            vec![PathBuf::from("/opt/bin"), PathBuf::from("/usr/bin")]
        );
        assert_eq!(config.stdin, StdinPolicy::Null);
        assert_eq!(config.resolver.current_dir, CurrentDirPolicy::Never);
    }

    #[test]
    fn test_from_env_has_no_extensions() {
        let config = ResolverConfig::from_env();
        assert!(config.extensions.is_empty());
        assert_eq!(config.current_dir, CurrentDirPolicy::Never);
    }

    #[test]
    fn test_path_str_keeps_policy() {
        let base = ResolverConfig::isolated(["/a"])
            .with_extensions([".sh"])
            .with_current_dir(CurrentDirPolicy::Last);
        let derived = base.with_path_str("/x:/y");
        assert_eq!(derived.search_path, vec![PathBuf::from("/x"), PathBuf::from("/y")]);
        assert_eq!(derived.extensions, vec![".sh".to_string()]);
        assert_eq!(derived.current_dir, CurrentDirPolicy::Last);
    }

    #[test]
    fn test_builders() {
        let config = SpawnerConfig::isolated(Vec::<PathBuf>::new())
            .with_name("ci")
            .with_default_dir("/tmp")
            .with_stdin(StdinPolicy::Inherit);
        assert_eq!(config.name, "ci");
        assert_eq!(config.default_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.stdin, StdinPolicy::Inherit);
    }
}
