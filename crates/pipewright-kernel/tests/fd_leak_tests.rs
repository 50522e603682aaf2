//! Descriptor accounting across many spawns. Counts this test binary's own
//! open descriptors, so it lives alone in its own process.

use std::fs;

use pipewright_kernel::{Command, Plan, Redirect, Spawner, SpawnerConfig};
use tempfile::TempDir;

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[tokio::test(flavor = "current_thread")]
async fn test_repeated_spawns_leak_no_descriptors() {
    let spawner = Spawner::new(SpawnerConfig::isolated(["/usr/bin", "/bin"]));
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing");

    // Warm up the runtime's own descriptors (signal pipe, reactor).
    spawner.status(Command::new("true")).await.unwrap();
    let before = open_fds();

    for _ in 0..50 {
        let pipeline = Command::new("printf").arg("x\\ny\\n") | Command::new("sort") | Command::new("cat");
        assert_eq!(spawner.read_to_string(pipeline).await.unwrap(), "x\ny\n");

        let failing = Command::new("sleep").arg("30")
            | Plan::from(Command::new("cat")).stdin(Redirect::read(&missing));
        assert!(spawner.spawn(failing).await.is_err());

        assert!(spawner.read(Command::new("false")).await.is_err());
        assert!(spawner.spawn(Command::new("no-such-program-here")).await.is_err());
    }

    assert!(spawner.live().is_empty());
    assert_eq!(open_fds(), before);
}
