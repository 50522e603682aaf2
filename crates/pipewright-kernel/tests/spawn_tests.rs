//! End-to-end spawning against real programs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use pipewright_kernel::{
    Command, Error, ErrorKind, PipeStream, Plan, ProcessState, Redirect, Redirects, SpawnMode,
    Spawner, SpawnerConfig,
};
use tempfile::TempDir;

fn spawner() -> Spawner {
    Spawner::new(SpawnerConfig::isolated(["/usr/bin", "/bin"]))
}

fn sh(script: &str) -> Command {
    Command::new("sh").arg("-c").arg(script)
}

// ============================================================================
// Output capture and pipelines
// ============================================================================

#[tokio::test]
async fn test_read_single_command() {
    let out = spawner()
        .read_to_string(Command::new("printf").arg("%s-%s").args(["a b", "c"]))
        .await
        .unwrap();
    assert_eq!(out, "a b-c");
}

#[tokio::test]
async fn test_pipeline_delivers_first_stage_output() {
    // The first stage also writes to stderr; only stdout flows down the pipe.
    let first = Plan::from(sh("printf 'line one\\nline two\\n'; printf noise >&2"))
        .stderr(Redirect::discard());
    let out = spawner()
        .read_to_string(first | Command::new("cat"))
        .await
        .unwrap();
    assert_eq!(out, "line one\nline two\n");
}

#[tokio::test]
async fn test_stderr_through_pipe_stream() {
    let spawner = spawner();
    let errors = PipeStream::shared().unwrap();
    let plan = Plan::from(sh("printf oops >&2")).stderr(Redirect::pipe(&errors));

    let process = spawner.spawn(plan).await.unwrap();
    assert_eq!(errors.read_to_string().await.unwrap(), "oops");
    assert!(process.wait().await.unwrap().success());
}

#[tokio::test]
async fn test_three_stage_pipeline() {
    let plan = Command::new("printf").arg("b\\nc\\na\\n")
        | Command::new("sort")
        | Command::new("head").args(["-n", "2"]);
    assert_eq!(spawner().read_to_string(plan).await.unwrap(), "a\nb\n");
}

#[tokio::test]
async fn test_early_exit_downstream_does_not_hang() {
    // `yes` only stops once every read end of its pipe is closed,
    // including the parent's copy.
    let plan = Command::new("yes") | Command::new("head").args(["-n", "1"]);
    let out = tokio::time::timeout(Duration::from_secs(10), spawner().read_to_string(plan))
        .await
        .expect("pipeline hung")
        .unwrap();
    assert_eq!(out, "y\n");
}

#[tokio::test]
async fn test_parallel_group_shares_stdout() {
    let plan = sh("echo one") & sh("echo two");
    let out = spawner().read_to_string(plan).await.unwrap();
    let mut lines: Vec<&str> = out.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["one", "two"]);
}

#[tokio::test]
async fn test_stdin_from_pipe_stream() {
    let spawner = spawner();
    let input = PipeStream::shared().unwrap();
    let output = PipeStream::shared().unwrap();
    let redirects = Redirects::default()
        .stdin(Redirect::pipe(&input))
        .stdout(Redirect::pipe(&output));

    let process = spawner
        .spawn_with(Command::new("tr").args(["a-z", "A-Z"]).into(), redirects, SpawnMode::Background)
        .await
        .unwrap();

    input.write(b"shout\n").await.unwrap();
    input.close_write().await;

    assert_eq!(output.read_line().await.unwrap(), "SHOUT\n");
    assert!(process.wait().await.unwrap().success());
    assert_eq!(process.pipes().len(), 2);
}

#[tokio::test]
async fn test_mark_reset_over_child_output() {
    let spawner = spawner();
    let out = PipeStream::shared().unwrap();
    let plan = Plan::from(Command::new("printf").arg("header\\nbody\\n")).stdout(Redirect::pipe(&out));
    let process = spawner.spawn(plan).await.unwrap();

    out.mark();
    let peek = out.read_line().await.unwrap();
    out.reset().unwrap();
    assert_eq!(out.read_line().await.unwrap(), peek);
    assert_eq!(out.read_line().await.unwrap(), "body\n");
    process.wait().await.unwrap();
}

#[tokio::test]
async fn test_isolated_stdin_is_null() {
    let out = tokio::time::timeout(Duration::from_secs(10), spawner().read(Command::new("cat")))
        .await
        .expect("cat waited on a terminal")
        .unwrap();
    assert!(out.is_empty());
}

// ============================================================================
// Files, handles, environment, directories
// ============================================================================

#[tokio::test]
async fn test_file_redirects() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out.txt");
    let spawner = spawner();

    spawner
        .run(Plan::from(Command::new("echo").arg("first")).stdout(Redirect::truncate(&out)))
        .await
        .unwrap();
    spawner
        .run(Plan::from(Command::new("echo").arg("second")).stdout(Redirect::append(&out)))
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "first\nsecond\n");

    let text = spawner
        .read_to_string(Plan::from(Command::new("cat")).stdin(Redirect::read(&out)))
        .await
        .unwrap();
    assert_eq!(text, "first\nsecond\n");

    spawner
        .run(Plan::from(Command::new("echo").arg("again")).stdout(Redirect::truncate(&out)))
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "again\n");
}

#[tokio::test]
async fn test_missing_input_file_is_os_error() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::from(Command::new("cat")).stdin(Redirect::read(dir.path().join("missing")));
    let err = spawner().spawn(plan).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Os);
}

#[tokio::test]
async fn test_inherited_fd() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fd.txt");
    let file = fs::File::create(&path).unwrap();

    let plan = Plan::from(Command::new("echo").arg("via fd")).stdout(Redirect::fd(file.into()));
    spawner().run(plan).await.unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "via fd\n");
}

#[tokio::test]
async fn test_env_overrides() {
    let spawner = spawner();
    let out = spawner
        .read_to_string(sh("printf '%s|%s' \"$FOO\" \"${BAR-unset}\"").env("FOO", "foo").env_remove("BAR"))
        .await
        .unwrap();
    assert_eq!(out, "foo|unset");

    let out = spawner
        .read_to_string(Command::new("env").full_env([("ONLY", "1")]))
        .await
        .unwrap();
    assert_eq!(out, "ONLY=1\n");
}

#[tokio::test]
async fn test_working_directory() {
    let dir = TempDir::new().unwrap();
    let out = spawner()
        .read_to_string(Command::new("pwd").dir(dir.path()))
        .await
        .unwrap();
    let reported = fs::canonicalize(out.trim_end()).unwrap();
    assert_eq!(reported, fs::canonicalize(dir.path()).unwrap());
}

#[tokio::test]
async fn test_path_override_resolves_against_command_env() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("custom-tool");
    fs::write(&script, "#!/bin/sh\necho custom\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let spawner = spawner();
    let cmd = Command::new("custom-tool");
    assert!(matches!(spawner.spawn(cmd.clone()).await, Err(Error::NotFound { .. })));

    let path = format!("{}:/usr/bin:/bin", dir.path().display());
    let out = spawner.read_to_string(cmd.env("PATH", path)).await.unwrap();
    assert_eq!(out, "custom\n");
}

#[tokio::test]
async fn test_argv0_is_program_as_written() {
    let out = spawner()
        .read_to_string(sh("printf %s \"$0\""))
        .await
        .unwrap();
    assert_eq!(out, "sh");
}

// ============================================================================
// Status aggregation
// ============================================================================

#[tokio::test]
async fn test_pipeline_status_is_last_stage() {
    let spawner = spawner();

    let status = spawner.status(Command::new("false") | Command::new("true")).await.unwrap();
    assert!(status.success());

    let status = spawner.status(Command::new("true") | Command::new("false")).await.unwrap();
    assert!(!status.success());
    assert_eq!(status.state, ProcessState::Exited(1));

    let status = spawner
        .status(Command::new("true") | Command::new("false").ignore_status())
        .await
        .unwrap();
    assert!(status.success());
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn test_parallel_status_requires_all() {
    let spawner = spawner();

    let status = spawner.status(Command::new("true") & sh("exit 3")).await.unwrap();
    assert!(!status.success());
    assert_eq!(status.code(), Some(3));

    let status = spawner
        .status(sh("exit 3").ignore_status() & Command::new("true"))
        .await
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_run_fails_with_status() {
    let err = spawner().run(sh("exit 7")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failed);
    match err {
        Error::Failed { command, status } => {
            assert_eq!(command, "sh -c 'exit 7'");
            assert_eq!(status.code(), Some(7));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_read_fails_like_run() {
    let err = spawner().read(sh("echo partial; exit 2")).await.unwrap_err();
    assert!(matches!(err, Error::Failed { .. }));
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_empty_program_fails_validation() {
    let err = spawner().spawn(Command::new("")).await.unwrap_err();
    assert!(matches!(err, Error::EmptyProgram));
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_nul_bytes_fail_validation() {
    let spawner = spawner();
    for cmd in [
        Command::new("echo").arg("a\0b"),
        Command::new("ec\0ho"),
        Command::new("env").env("K", "v\0"),
        Command::new("pwd").dir("/tmp\0x"),
    ] {
        let err = spawner.spawn(cmd).await.unwrap_err();
        assert!(matches!(err, Error::NulByte { .. }), "got {err:?}");
    }

    let plan = Plan::from(Command::new("echo")).stdout(Redirect::truncate("out\0.txt"));
    assert!(matches!(spawner.spawn(plan).await, Err(Error::NulByte { .. })));
    assert!(spawner.live().is_empty());
}

// ============================================================================
// Kill, wait and the registry
// ============================================================================

#[tokio::test]
async fn test_kill_running_process() {
    let spawner = spawner();
    let process = spawner.spawn(Command::new("sleep").arg("30")).await.unwrap();
    assert_eq!(spawner.live().len(), 1);

    process.kill(15).unwrap();
    let status = process.wait().await.unwrap();
    assert_eq!(status.state, ProcessState::Signaled(15));
    assert!(!status.success());
    assert!(spawner.live().is_empty());
}

#[tokio::test]
async fn test_kill_after_exit() {
    let process = spawner().spawn(Command::new("true")).await.unwrap();
    process.wait().await.unwrap();

    // No-op on an exited process, but a bad signal is still rejected.
    process.kill(9).unwrap();
    process.kill(15).unwrap();
    let err = process.kill(4242).unwrap_err();
    assert!(matches!(err, Error::InvalidSignal(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_wait_is_repeatable_and_cancel_safe() {
    let process = spawner().spawn(Command::new("sleep").arg("0.3")).await.unwrap();

    let early = tokio::time::timeout(Duration::from_millis(20), process.wait()).await;
    assert!(early.is_err(), "sleep finished too early");
    assert!(process.try_status().unwrap().is_none());

    let first = process.wait().await.unwrap();
    let second = process.wait().await.unwrap();
    assert_eq!(first, second);
    assert!(first.success());
    assert!(process.is_finished());
}

#[tokio::test]
async fn test_wait_mode() {
    let process = spawner()
        .spawn_with(Command::new("true").into(), Redirects::default(), SpawnMode::Wait)
        .await
        .unwrap();
    assert!(process.try_status().unwrap().is_some());
}

#[tokio::test]
async fn test_pipeline_handle_lists_children() {
    let spawner = spawner();
    let process = spawner
        .spawn(Command::new("sleep").arg("30") | Command::new("cat"))
        .await
        .unwrap();

    assert_eq!(process.pids().len(), 2);
    assert!(process.pids().iter().all(|&pid| pid > 0));
    let live = spawner.live();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|info| info.owner == process.id()));
    assert_eq!(live[0].command, "sleep 30");
    assert_eq!(process.to_string(), format!("[{}] sleep 30 | cat", process.id()));

    spawner.kill_all(9).unwrap();
    let done = spawner.wait_all().await.unwrap();
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|info| info.state.is_finished()));
    assert!(spawner.live().is_empty());
    assert!(process.wait().await.is_ok());
}

#[tokio::test]
async fn test_reap_collects_finished_children() {
    let spawner = spawner();
    let process = spawner.spawn(Command::new("true")).await.unwrap();
    let id = process.children()[0].id();
    assert!(spawner.get(id).is_some());

    let mut reaped = Vec::new();
    for _ in 0..200 {
        reaped.extend(spawner.reap().unwrap());
        if !reaped.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].state, ProcessState::Exited(0));
    assert!(spawner.get(id).is_none());
    assert_eq!(process.try_status().unwrap().map(|s| s.success()), Some(true));
}

#[tokio::test]
async fn test_detached_child_runs() {
    let status = spawner().status(Command::new("true").detach()).await.unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_spawn_task_hands_over_process() {
    let spawner = Arc::new(spawner());
    let rx = spawner.spawn_task(Command::new("echo").arg("hi"), Redirects::default().stdout(Redirect::discard()));
    let process = rx.recv().await.unwrap();
    assert!(process.wait().await.unwrap().success());

    let rx = spawner.spawn_task(Command::new(""), Redirects::default());
    assert!(matches!(rx.recv().await, Err(Error::EmptyProgram)));
}

#[tokio::test]
async fn test_failure_part_way_kills_started_stages() {
    let dir = TempDir::new().unwrap();
    let spawner = spawner();
    let plan = Command::new("sleep").arg("30")
        | Plan::from(Command::new("cat")).stdin(Redirect::read(dir.path().join("missing")));

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(10), spawner.spawn(plan))
        .await
        .expect("cleanup waited on the first stage")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Os);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(spawner.live().is_empty());
}

#[tokio::test]
async fn test_output_pipe_is_handed_over_once() {
    let spawner = spawner();
    let out = PipeStream::shared().unwrap();
    let redirects = Redirects::default().stdout(Redirect::pipe(&out));

    let process = spawner
        .spawn_with(Command::new("echo").arg("once").into(), redirects.clone(), SpawnMode::Background)
        .await
        .unwrap();
    assert!(out.is_write_closed());

    let err = spawner
        .spawn_with(Command::new("echo").arg("twice").into(), redirects, SpawnMode::Background)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WriteClosed));
    assert!(spawner.live().iter().all(|info| info.command == "echo once"));

    assert_eq!(out.read_to_string().await.unwrap(), "once\n");
    assert!(process.wait().await.unwrap().success());
}
