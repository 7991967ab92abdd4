//! Lifecycle tests for fork-based threads.

use forksync::prelude::*;
use forksync::process::{PANIC_EXIT_CODE, is_alive};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

static FORK_GUARD: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    FORK_GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State letter of a process from `/proc/<pid>/stat`.
fn proc_state(pid: u32) -> Option<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let end = stat.rfind(')')?;
    stat[end + 1..].split_whitespace().next().map(str::to_owned)
}

fn wait_for_state(pid: u32, state: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if proc_state(pid).as_deref() == Some(state) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_exit_code_is_captured() {
    let _serial = serial();
    let mut dispatcher = Dispatcher::new();
    let mut handle = ThreadHandle::default();

    let pid = handle.start(&mut dispatcher, || 42).unwrap();
    assert_eq!(handle.pid(), Some(pid));
    assert!(handle.is_running());

    assert_eq!(handle.join(&mut dispatcher), JoinStatus::Exited(42));
    assert_eq!(handle.exit_code(), Some(42));
    assert!(!handle.is_running());

    // Joining again reports the recorded outcome.
    assert_eq!(handle.try_join(&mut dispatcher), JoinStatus::Exited(42));
}

#[test]
fn test_panicking_body_exits_with_panic_code() {
    let _serial = serial();
    let mut dispatcher = Dispatcher::new();
    let mut handle = ThreadHandle::default();

    handle
        .start(&mut dispatcher, || panic!("worker failure"))
        .unwrap();
    assert_eq!(
        handle.join(&mut dispatcher),
        JoinStatus::Exited(PANIC_EXIT_CODE)
    );
}

#[test]
fn test_force_stop_kills_child() {
    let _serial = serial();
    let mut dispatcher = Dispatcher::new();
    let mut handle = ThreadHandle::default();

    handle
        .start(&mut dispatcher, || loop {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
    assert_eq!(handle.try_join(&mut dispatcher), JoinStatus::Running);

    assert!(handle.stop(&mut dispatcher, true));
    assert_eq!(
        handle.try_join(&mut dispatcher),
        JoinStatus::Signaled(libc::SIGKILL)
    );
    assert!(!handle.stop(&mut dispatcher, true));
}

#[test]
fn test_pause_and_resume() {
    let _serial = serial();
    let mut dispatcher = Dispatcher::new();
    let mut handle = ThreadHandle::default();

    let pid = handle
        .start(&mut dispatcher, || {
            std::thread::sleep(Duration::from_millis(800));
            0
        })
        .unwrap();

    assert!(handle.pause());
    assert!(wait_for_state(pid, "T"));
    // A stopped process is still alive.
    assert!(is_alive(pid));

    assert!(handle.resume());
    assert_eq!(handle.join(&mut dispatcher), JoinStatus::Exited(0));
    assert!(!handle.pause());
}

#[test]
fn test_start_twice_while_running_fails() {
    let _serial = serial();
    let mut dispatcher = Dispatcher::new();
    let mut handle = ThreadHandle::default();

    handle
        .start(&mut dispatcher, || {
            std::thread::sleep(Duration::from_millis(200));
            0
        })
        .unwrap();
    assert!(matches!(
        handle.start(&mut dispatcher, || 0),
        Err(Error::Spawn(_))
    ));
    assert_eq!(handle.join(&mut dispatcher), JoinStatus::Exited(0));

    // A finished handle can be started again.
    handle.start(&mut dispatcher, || 5).unwrap();
    assert_eq!(handle.join(&mut dispatcher), JoinStatus::Exited(5));
}
