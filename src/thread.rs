//! Fork-based threads.
//!
//! A [`ThreadHandle`] forks the calling process and runs a closure in the
//! child. Every [`SharedSection`] attached to the handle is initialized in
//! both processes right after the fork; the child's body runs only if its
//! side of every link came up. The parent keeps serving the sections through
//! its [`Dispatcher`], most conveniently from [`ThreadHandle::join`].
//!
//! Threads cannot start threads: the child's dispatcher copy is switched to
//! the client role and never serves anything.

use crate::config::BackoffRange;
use crate::dispatcher::{DispatchMode, Dispatcher};
use crate::error::{Error, Result};
use crate::observability::span_thread;
use crate::process::{
    Fork, INIT_FAILURE_EXIT_CODE, PANIC_EXIT_CODE, Pid, WaitOutcome, current_pid, exit_child,
    fork, reap, signal,
};
use crate::section::SharedSection;
use std::fmt;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a thread handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinStatus {
    /// The child is still running.
    Running,
    /// The child exited with this code.
    Exited(i32),
    /// The child was killed by this signal.
    Signaled(i32),
    /// The child could not be waited for (never started, or reaped elsewhere).
    Lost,
}

impl JoinStatus {
    /// Whether the child has terminated.
    pub fn is_finished(self) -> bool {
        self != JoinStatus::Running
    }
}

/// A forked child running a closure, with its sections wired up.
#[derive(Debug)]
pub struct ThreadHandle {
    id: ThreadId,
    sections: Vec<SharedSection>,
    join_backoff: BackoffRange,
    child: Option<Pid>,
    status: Option<JoinStatus>,
    finalized: bool,
}

impl ThreadHandle {
    /// Create a handle that will share `sections` with its child.
    pub fn new(sections: Vec<SharedSection>) -> Self {
        let join_backoff = sections
            .first()
            .map(SharedSection::config)
            .unwrap_or_default()
            .join_backoff;
        Self {
            id: ThreadId::next(),
            sections,
            join_backoff,
            child: None,
            status: None,
            finalized: true,
        }
    }

    /// Handle identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Child process, once started.
    pub fn pid(&self) -> Option<Pid> {
        self.child
    }

    /// Exit code, once the child exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            Some(JoinStatus::Exited(code)) => Some(code),
            _ => None,
        }
    }

    /// Whether the child was started and has not been reaped.
    pub fn is_running(&self) -> bool {
        self.child.is_some() && self.status.is_none()
    }

    /// Fork and run `body` in the child.
    ///
    /// The body's return value becomes the child's exit code. A panicking
    /// body exits with [`PANIC_EXIT_CODE`]; a child whose sections failed to
    /// initialize exits with [`INIT_FAILURE_EXIT_CODE`] without running the
    /// body. If the parent's side of a section fails to initialize, the child
    /// is killed and an error is returned.
    pub fn start<F>(&mut self, dispatcher: &mut Dispatcher, body: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        if self.is_running() {
            return Err(Error::Spawn(format!("thread {} is already running", self.id)));
        }

        // Buffered output would otherwise be written by both processes.
        let _ = std::io::stdout().flush();

        match fork()? {
            Fork::Child => {
                dispatcher.become_client();
                let me = current_pid();
                let ready = self.sections.iter().all(|s| s.initialize(me, self.id));
                if !ready {
                    exit_child(INIT_FAILURE_EXIT_CODE);
                }

                let code = catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_EXIT_CODE);
                let _ = std::io::stdout().flush();
                exit_child(code)
            }
            Fork::Parent(child) => {
                self.child = Some(child);
                self.status = None;
                self.finalized = false;

                let span = span_thread(self.id.as_u64(), child);
                let _guard = span.enter();

                let ready = self
                    .sections
                    .iter()
                    .fold(true, |ok, s| s.initialize(child, self.id) && ok);
                if !ready {
                    signal(child, libc::SIGKILL);
                    self.wait_blocking(dispatcher);
                    return Err(Error::Spawn(format!(
                        "sections of thread {} failed to initialize",
                        self.id
                    )));
                }

                tracing::debug!(thread = %self.id, child, sections = self.sections.len(), "thread started");
                Ok(child)
            }
        }
    }

    /// Probe the child once without blocking.
    pub fn try_join(&mut self, dispatcher: &mut Dispatcher) -> JoinStatus {
        if let Some(status) = self.status {
            return status;
        }
        let Some(child) = self.child else {
            return JoinStatus::Lost;
        };

        let status = match reap(child) {
            WaitOutcome::Running => return JoinStatus::Running,
            WaitOutcome::Exited(code) => JoinStatus::Exited(code),
            WaitOutcome::Signaled(sig) => JoinStatus::Signaled(sig),
            WaitOutcome::Gone => JoinStatus::Lost,
        };

        dispatcher.mark_departed(child);
        self.finalize();
        self.status = Some(status);
        tracing::debug!(thread = %self.id, child, ?status, "thread joined");
        status
    }

    /// Wait for the child to finish, serving section requests meanwhile.
    pub fn join(&mut self, dispatcher: &mut Dispatcher) -> JoinStatus {
        loop {
            let status = self.try_join(dispatcher);
            if status.is_finished() {
                return status;
            }
            if dispatcher.peer_count() > 0 {
                dispatcher.tick(DispatchMode::Blocking);
            } else {
                self.join_backoff.sleep();
            }
        }
    }

    fn wait_blocking(&mut self, dispatcher: &mut Dispatcher) -> JoinStatus {
        loop {
            let status = self.try_join(dispatcher);
            if status.is_finished() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Terminate the child (`SIGTERM`, or `SIGKILL` with `force`) and join it.
    ///
    /// Returns `false` if the child is not running or the signal could not
    /// be delivered.
    pub fn stop(&mut self, dispatcher: &mut Dispatcher, force: bool) -> bool {
        let Some(child) = self.child.filter(|_| self.status.is_none()) else {
            return false;
        };
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        if !signal(child, sig) {
            return false;
        }
        self.join(dispatcher);
        true
    }

    /// Suspend the child with `SIGSTOP`.
    pub fn pause(&self) -> bool {
        self.child
            .filter(|_| self.status.is_none())
            .is_some_and(|child| signal(child, libc::SIGSTOP))
    }

    /// Resume a paused child with `SIGCONT`.
    pub fn resume(&self) -> bool {
        self.child
            .filter(|_| self.status.is_none())
            .is_some_and(|child| signal(child, libc::SIGCONT))
    }

    /// Detach the child from every section. Runs at most once per start.
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        for section in &self.sections {
            section.finalize(self.id);
        }
    }
}

impl Default for ThreadHandle {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_are_unique() {
        let a = ThreadHandle::default();
        let b = ThreadHandle::default();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_unstarted_handle() {
        let mut dispatcher = Dispatcher::new();
        let mut handle = ThreadHandle::default();

        assert!(!handle.is_running());
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.try_join(&mut dispatcher), JoinStatus::Lost);
        assert_eq!(handle.exit_code(), None);
        assert!(!handle.stop(&mut dispatcher, false));
        assert!(!handle.pause());
        assert!(!handle.resume());
    }

    #[test]
    fn test_join_status_is_finished() {
        assert!(!JoinStatus::Running.is_finished());
        assert!(JoinStatus::Exited(0).is_finished());
        assert!(JoinStatus::Signaled(9).is_finished());
        assert!(JoinStatus::Lost.is_finished());
    }
}
