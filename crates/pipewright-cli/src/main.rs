//! pipewright CLI entry point.
//!
//! Usage:
//!   pipewright split <line>             # Print the words of a command line as JSON
//!   pipewright escape [--posix] <arg>...# Render arguments as one command line
//!   pipewright which [-a] <name>        # Resolve a program against PATH
//!   pipewright run <line>               # Run a pipeline, exit with its status

use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use pipewright_kernel::lexer::split_words;
use pipewright_kernel::{
    Command, Error, Plan, ProcessState, Resolver, Spawner, SpawnerConfig, escape, escape_portable,
    split,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!("pipewright {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }

        Some("split") => {
            let line = args.get(2).context("split requires a command line")?;
            let words = split(line)?;
            println!("{}", serde_json::to_string(&words)?);
            Ok(ExitCode::SUCCESS)
        }

        Some("escape") => {
            let rest = &args[2..];
            match rest.first().map(|s| s.as_str()) {
                Some("--posix") => println!("{}", escape_portable(&rest[1..])),
                _ => println!("{}", escape(rest)),
            }
            Ok(ExitCode::SUCCESS)
        }

        Some("which") => run_which(&args[2..]),

        Some("run") => {
            let line = args.get(2).context("run requires a command line")?;
            run_line(line)
        }

        Some(unknown) => {
            eprintln!("Unknown command: {unknown}");
            eprintln!("Run 'pipewright --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_help() {
    println!(
        r#"pipewright v{}

Usage:
  pipewright split <line>              Print the words of <line> as a JSON array
  pipewright escape [--posix] <arg>... Quote arguments into one command line
  pipewright which [-a] <name>         Resolve <name> against PATH
  pipewright run <line>                Run <line>, splitting stages on unquoted |

Options:
  -h, --help                           Show this help
  -V, --version                        Show version

Examples:
  pipewright split "echo 'a b' c"      # ["echo","a b","c"]
  pipewright escape --posix 'a b' c=1  # a\ b c=1
  pipewright which -a sh
  pipewright run "ls -1 | sort -r"
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Print the resolved path, or every match with `-a`.
fn run_which(args: &[String]) -> Result<ExitCode> {
    let (all, name) = match args {
        [flag, name] if flag == "-a" => (true, name),
        [name] => (false, name),
        _ => bail!("usage: pipewright which [-a] <name>"),
    };

    let resolver = Resolver::from_env();
    let found = if all {
        resolver.which_all(name)?
    } else {
        match resolver.which(name) {
            Ok(path) => vec![path],
            Err(e @ (Error::NotFound { .. } | Error::NotExecutable { .. })) => {
                eprintln!("{e}");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        }
    };

    for path in &found {
        println!("{}", path.display());
    }
    Ok(if found.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Run a command line and exit with its status.
fn run_line(line: &str) -> Result<ExitCode> {
    let plan = parse_pipeline(line)?;
    debug!(%plan, stages = plan.commands().len(), "running");
    let spawner = Spawner::new(SpawnerConfig::from_env());

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt
        .block_on(spawner.status(plan))
        .with_context(|| format!("running {line}"))?;

    debug!(%status, "finished");
    let code = match status.state {
        ProcessState::Signaled(signal) => 128 + signal,
        _ if status.success() => 0,
        _ => status.code().unwrap_or(1),
    };
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

/// Split on unquoted `|` words into pipeline stages.
fn parse_pipeline(line: &str) -> Result<Plan> {
    let mut stages = Vec::new();
    let mut argv: Vec<String> = Vec::new();
    for word in split_words(line)? {
        if word.text == "|" && !word.quoted {
            stages.push(stage(std::mem::take(&mut argv))?);
        } else {
            argv.push(word.text);
        }
    }
    stages.push(stage(argv)?);
    Ok(Plan::pipeline(stages)?)
}

fn stage(argv: Vec<String>) -> Result<Command> {
    if argv.is_empty() {
        bail!("empty pipeline stage");
    }
    Ok(Command::from_argv(argv)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_kernel::PlanKind;

    #[test]
    fn test_single_command() {
        let plan = parse_pipeline("echo 'a | b'").unwrap();
        match plan.kind() {
            PlanKind::Command(cmd) => assert_eq!(cmd.get_args(), ["a | b"]),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn test_stages() {
        let plan = parse_pipeline("printf x | tr x y | cat").unwrap();
        assert_eq!(plan.commands().len(), 3);
        assert_eq!(plan.to_string(), "printf x | tr x y | cat");
    }

    #[test]
    fn test_quoted_bar_is_an_argument() {
        let plan = parse_pipeline(r"grep \| file").unwrap();
        assert!(matches!(plan.kind(), PlanKind::Command(_)));
    }

    #[test]
    fn test_empty_stage_rejected() {
        assert!(parse_pipeline("ls | | cat").is_err());
        assert!(parse_pipeline("ls |").is_err());
        assert!(parse_pipeline("").is_err());
    }
}
