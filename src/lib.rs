//! # forksync
//!
//! Cooperative "threads" built from forked processes, coordinated through
//! named pipes.
//!
//! The centerpiece is the [`SharedSection`](section::SharedSection): a
//! cross-process mutex bundled with a small key/value store. The process that
//! creates a section serves it; forked peers talk to it over a pair of FIFOs
//! and a fixed-width text protocol, and the creator's
//! [`Dispatcher`](dispatcher::Dispatcher) answers their requests.
//!
//! ## Features
//!
//! - **Single-writer locking**: the lock owner is tracked by the creator and
//!   handed over on LOCK/UNLOCK requests, with dead owners overridden
//! - **Reliable and unreliable stores**: lock-gated state next to a
//!   best-effort store anyone may write
//! - **Liveness-bounded waits**: every blocking call gives up once the
//!   process on the other end is dead
//! - **Fair dispatch**: the lock owner and recently active peers are served
//!   first
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forksync::prelude::*;
//!
//! let mut dispatcher = Dispatcher::new();
//! let counter = SharedSection::new(&mut dispatcher, SectionConfig::from_env());
//!
//! let mut workers: Vec<ThreadHandle> = (0..4)
//!     .map(|_| ThreadHandle::new(vec![counter.clone()]))
//!     .collect();
//!
//! for worker in &mut workers {
//!     let section = counter.clone();
//!     worker.start(&mut dispatcher, move || {
//!         section.lock(true);
//!         let n = section.get("n").ok().flatten().map_or(0, |v| v[0]);
//!         section.add_or_update("n", vec![n + 1]).ok();
//!         section.unlock(true);
//!         0
//!     })?;
//! }
//! for worker in &mut workers {
//!     worker.join(&mut dispatcher);
//! }
//! assert_eq!(counter.get_fast("n"), Some(vec![4]));
//! ```
//!
//! Unix only: the crate relies on `fork`, FIFOs and `/proc`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gc;
pub mod link;
pub mod observability;
pub mod process;
pub mod section;
pub mod store;
pub mod thread;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{BackoffRange, SectionConfig};
    pub use crate::dispatcher::{DispatchMode, Dispatcher, Role};
    pub use crate::error::{Error, Result};
    pub use crate::gc::clean_pipe_garbage;
    pub use crate::section::{LockState, SectionId, SharedSection};
    pub use crate::thread::{JoinStatus, ThreadHandle, ThreadId};
}

pub use error::{Error, Result};
