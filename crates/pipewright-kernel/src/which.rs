//! Executable lookup.
//!
//! Names containing a `/` are taken as paths and only checked. Bare names
//! are searched for in the configured directories, trying the name itself
//! and then each extension suffix, and the first executable regular file
//! wins.

use std::path::{Path, PathBuf};

use nix::unistd::{AccessFlags, access};
use pipewright_types::{Error, Result};

use crate::config::{CurrentDirPolicy, ResolverConfig};

/// Resolves program names to executable paths.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolver over the environment's `PATH`.
    pub fn from_env() -> Self {
        Self::new(ResolverConfig::from_env())
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `name` to an absolute executable path.
    pub fn which(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;

        if is_explicit_path(name) {
            return resolve_explicit(name);
        }

        let dirs = self.search_dirs()?;
        let mut not_executable: Option<PathBuf> = None;
        for dir in &dirs {
            for candidate in self.candidates(dir, name) {
                if is_executable(&candidate) {
                    return absolutize(candidate);
                }
                if not_executable.is_none() && candidate.is_file() {
                    not_executable = Some(candidate);
                }
            }
        }

        match not_executable {
            Some(path) => Err(Error::NotExecutable { path: absolutize(path)? }),
            None => Err(Error::NotFound {
                name: name.to_string(),
                searched: describe(&dirs),
            }),
        }
    }

    /// Resolve `name` against a `PATH`-style string instead of the
    /// configured search path.
    pub fn which_in(&self, name: &str, path: &str) -> Result<PathBuf> {
        Resolver::new(self.config.with_path_str(path)).which(name)
    }

    /// Every executable match for `name`, in search order.
    ///
    /// An explicit path yields itself when executable. No match is an
    /// empty list, not an error.
    pub fn which_all(&self, name: &str) -> Result<Vec<PathBuf>> {
        check_name(name)?;

        if is_explicit_path(name) {
            return match resolve_explicit(name) {
                Ok(path) => Ok(vec![path]),
                Err(_) => Ok(Vec::new()),
            };
        }

        let mut found = Vec::new();
        for dir in self.search_dirs()? {
            for candidate in self.candidates(&dir, name) {
                if is_executable(&candidate) {
                    let path = absolutize(candidate)?;
                    if !found.contains(&path) {
                        found.push(path);
                    }
                }
            }
        }
        Ok(found)
    }

    fn search_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = self
            .config
            .search_path
            .iter()
            .filter(|dir| !dir.as_os_str().is_empty())
            .cloned()
            .collect();

        match self.config.current_dir {
            CurrentDirPolicy::Never => {}
            CurrentDirPolicy::First => dirs.insert(0, current_dir()?),
            CurrentDirPolicy::Last => dirs.push(current_dir()?),
        }
        Ok(dirs)
    }

    fn candidates<'a>(&'a self, dir: &'a Path, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        std::iter::once(dir.join(name)).chain(
            self.config
                .extensions
                .iter()
                .map(move |ext| dir.join(format!("{name}{ext}"))),
        )
    }
}

/// Resolve `name` against the environment's `PATH`.
pub fn which(name: &str) -> Result<PathBuf> {
    Resolver::from_env().which(name)
}

/// True for a regular file the current user may execute.
pub fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn is_explicit_path(name: &str) -> bool {
    name.contains('/')
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::EmptyProgram);
    }
    Error::check_nul(|| "program".to_string(), name)
}

fn resolve_explicit(name: &str) -> Result<PathBuf> {
    let path = absolutize(PathBuf::from(name))?;
    if is_executable(&path) {
        Ok(path)
    } else if path.is_file() {
        Err(Error::NotExecutable { path })
    } else {
        Err(Error::NotFound {
            name: name.to_string(),
            searched: path.display().to_string(),
        })
    }
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    std::path::absolute(&path)
        .map_err(|e| Error::io(format!("making {} absolute", path.display()), e))
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().map_err(|e| Error::io("reading the current directory", e))
}

fn describe(dirs: &[PathBuf]) -> String {
    if dirs.is_empty() {
        return "an empty search path".to_string();
    }
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}
