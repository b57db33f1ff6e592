//! Races with dying threads are logged at error level.

mod common;

use common::{isolated_coordinator, wait_until};
use freezeframe::ckpt::log::{log_init, LevelFilter};
use freezeframe::ckpt::ThreadState;
use std::time::Duration;

#[test]
fn test_vanished_zombie_is_logged_as_error() {
    let path = std::env::temp_dir().join(format!("freezeframe-errors-{}.log", std::process::id()));
    let path_str = path.to_str().unwrap().to_string();
    log_init(Some(&path_str), LevelFilter::Error).unwrap();

    let coord = isolated_coordinator();
    let done = coord.spawn(|| ()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.is_finished()));
    let tid = done.tid();

    // the OS thread may linger briefly after its routine returned
    let retired = wait_until(Duration::from_secs(5), || {
        coord.suspend_all().unwrap();
        coord.resume_all().unwrap();
        !coord.threads().iter().any(|t| t.tid == tid)
    });
    assert!(retired);
    assert!(coord
        .threads()
        .iter()
        .all(|t| t.state == ThreadState::Coordinator));

    log_init(None, LevelFilter::Off).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert!(
        contents.contains("no longer exists"),
        "log was: {}",
        contents
    );
    assert!(contents.contains("ERROR"), "log was: {}", contents);

    // already retired by the scan
    done.join().unwrap();
    assert_eq!(coord.threads().len(), 1);
    coord.teardown().unwrap();
}
