#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use minisysd::{
    paths,
    supervisor::{Context, SupervisorOptions},
    unit::{Unit, UnitState},
};
use tempfile::TempDir;

// One context per test binary: the reaper owns waitpid(-1) for the whole
// process, and a second wait loop would steal its results.
static CONTEXT: OnceLock<(TempDir, Arc<Context>)> = OnceLock::new();

pub fn test_context() -> &'static Arc<Context> {
    let (_, ctx) = CONTEXT.get_or_init(|| {
        let root = tempfile::tempdir().expect("create sandbox root");
        paths::init_root(root.path());
        fs::create_dir_all(root.path().join("etc/systemd/system")).unwrap();
        let ctx = Context::new(SupervisorOptions {
            pid_tracking: false,
            ..SupervisorOptions::default()
        });
        (root, ctx)
    });
    ctx
}

pub fn unit_dir() -> PathBuf {
    test_context().paths.etc_unit_dir()
}

pub fn write_unit(file_name: &str, contents: &str) {
    let dir = unit_dir();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file_name), contents).unwrap();
}

pub fn wait_for_state(unit: &Arc<Unit>, state: UnitState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if unit.state() == state {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} to reach {state}, currently {}",
                unit.name(),
                unit.state()
            );
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}
