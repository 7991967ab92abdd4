//! Process primitives: liveness probing, forking and reaping.
//!
//! Liveness is the backbone of every wait in this crate. A blocked send,
//! receive or lock request gives up as soon as the process on the other end
//! is found dead, so the probe has to be cheap and must not be fooled by
//! zombies: an exited child that has not been reaped yet still answers the
//! zero-signal probe, but it will never read from its pipe again.

use crate::error::{Error, Result};
use rustix::io::Errno;

/// Operating system process identifier.
pub type Pid = u32;

/// Exit code used by a forked child whose sections failed to initialize.
pub const INIT_FAILURE_EXIT_CODE: i32 = 254;

/// Exit code used by a forked child whose body panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Identifier of the calling process.
pub fn current_pid() -> Pid {
    std::process::id()
}

/// Check whether a process exists and is not a zombie.
///
/// Uses the zero-signal probe. `EPERM` means the process exists but belongs
/// to someone else, which still counts as alive.
pub fn is_alive(pid: Pid) -> bool {
    let Some(target) = i32::try_from(pid)
        .ok()
        .and_then(rustix::process::Pid::from_raw)
    else {
        return false;
    };

    match rustix::process::test_kill_process(target) {
        Ok(()) | Err(Errno::PERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Read the scheduler state letter from `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so the state is the first field after the last `)`.
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Result of [`fork`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fork {
    /// Running in the original process; carries the child's pid.
    Parent(Pid),
    /// Running in the new child process.
    Child,
}

/// Fork the calling process.
///
/// Only the calling thread survives in the child. The child is expected to
/// run its body and leave through [`exit_child`].
pub fn fork() -> Result<Fork> {
    // SAFETY: fork has no memory-safety preconditions; the child keeps
    // running on this thread only and terminates through `_exit`.
    match unsafe { libc::fork() } {
        -1 => Err(Error::Spawn(std::io::Error::last_os_error().to_string())),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid as Pid)),
    }
}

/// Terminate a forked child without running the parent's atexit handlers.
pub fn exit_child(code: i32) -> ! {
    // SAFETY: `_exit` never returns and touches no Rust state.
    unsafe { libc::_exit(code) }
}

/// Outcome of a [`reap`] probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child has not exited yet.
    Running,
    /// The child exited normally with this status code.
    Exited(i32),
    /// The child was terminated by this signal.
    Signaled(i32),
    /// The pid is not (or no longer) a child of this process.
    Gone,
}

/// Reap a child without blocking.
pub fn reap(pid: Pid) -> WaitOutcome {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid, writable c_int for the call's duration.
        let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
        match ret {
            0 => return WaitOutcome::Running,
            -1 if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted => {
                continue;
            }
            -1 => return WaitOutcome::Gone,
            _ if libc::WIFEXITED(status) => return WaitOutcome::Exited(libc::WEXITSTATUS(status)),
            _ if libc::WIFSIGNALED(status) => return WaitOutcome::Signaled(libc::WTERMSIG(status)),
            _ => return WaitOutcome::Running,
        }
    }
}

/// Send a signal to a process. Returns `true` if it was delivered.
pub fn signal(pid: Pid, signal: libc::c_int) -> bool {
    let Ok(target) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if target <= 0 {
        return false;
    }
    // SAFETY: kill has no memory-safety preconditions.
    unsafe { libc::kill(target, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(current_pid()));
    }

    #[test]
    fn test_pid_zero_is_not_alive() {
        assert!(!is_alive(0));
    }

    #[test]
    fn test_out_of_range_pid_is_not_alive() {
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();

        // Until reaped the child lingers as a zombie, which must already count as dead.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while is_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!is_alive(pid));

        let outcome = reap(pid);
        assert_eq!(outcome, WaitOutcome::Exited(0));
        assert_eq!(reap(pid), WaitOutcome::Gone);
    }

    #[test]
    fn test_signal_rejects_invalid_pid() {
        assert!(!signal(0, 0));
    }
}
