//! Configuration for critical sections and their links.

use crate::channel::ChannelTimeouts;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory for named pipes (tmpfs-backed on Linux).
pub const DEFAULT_PIPE_DIR: &str = "/dev/shm";

/// Environment variable overriding the pipe directory.
pub const PIPE_DIR_ENV: &str = "FORKSYNC_PIPE_DIR";

/// A closed interval from which randomized sleep durations are drawn.
///
/// Randomization keeps sibling processes that failed at the same moment
/// from retrying in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffRange {
    /// Shortest sleep.
    pub min: Duration,
    /// Longest sleep.
    pub max: Duration,
}

impl BackoffRange {
    /// Create a range from two bounds in milliseconds.
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Draw a duration uniformly from the range.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_micros() as u64;
        let hi = self.max.as_micros() as u64;
        Duration::from_micros(rand::rng().random_range(lo..=hi))
    }

    /// Sleep for a randomly drawn duration.
    pub fn sleep(&self) {
        std::thread::sleep(self.sample());
    }
}

/// Configuration shared by a section, its links and the dispatcher.
///
/// # Example
///
/// ```rust,ignore
/// use forksync::config::SectionConfig;
///
/// let config = SectionConfig::default()
///     .with_pipe_dir("/tmp/forksync")
///     .with_open_retries(10);
/// ```
#[derive(Clone, Debug)]
pub struct SectionConfig {
    /// Directory holding the named pipes.
    pub pipe_dir: PathBuf,
    /// Attempts made to open each channel of a link.
    pub open_retries: u32,
    /// Sleep between channel open attempts.
    pub open_backoff: BackoffRange,
    /// Sleep between send/receive attempts while the peer is alive.
    pub io_backoff: BackoffRange,
    /// Wait for a pipe to become writable before a send is abandoned.
    pub send_ready_timeout: Duration,
    /// Wait for buffer space while flushing a partially written frame.
    pub flush_timeout: Duration,
    /// Wait for the first byte of an inbound frame.
    pub receive_timeout: Duration,
    /// Silence after which an inbound frame is considered complete.
    pub idle_gap: Duration,
    /// Wait used by the non-committing availability probe.
    pub probe_timeout: Duration,
    /// Per-peer receive budget of a blocking dispatch with a single peer.
    pub dispatch_slice: Duration,
    /// Lower bound of the per-peer budget as load grows.
    pub min_dispatch_slice: Duration,
    /// Sleep between exit polls of a blocking join with nothing to dispatch.
    pub join_backoff: BackoffRange,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            pipe_dir: PathBuf::from(DEFAULT_PIPE_DIR),
            open_retries: 60,
            open_backoff: BackoffRange::from_millis(5, 80),
            io_backoff: BackoffRange::from_millis(10, 200),
            send_ready_timeout: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_millis(700),
            idle_gap: Duration::from_millis(22),
            probe_timeout: Duration::from_millis(15),
            dispatch_slice: Duration::from_millis(700),
            min_dispatch_slice: Duration::from_millis(20),
            join_backoff: BackoffRange::from_millis(60, 200),
        }
    }
}

impl SectionConfig {
    /// Defaults, with the pipe directory taken from `FORKSYNC_PIPE_DIR` if set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var_os(PIPE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => config.with_pipe_dir(PathBuf::from(dir)),
            _ => config,
        }
    }

    /// Set the pipe directory. Trailing slashes and spaces are stripped.
    pub fn with_pipe_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.pipe_dir = normalize_dir(dir.as_ref());
        self
    }

    /// Set the number of channel open attempts.
    pub fn with_open_retries(mut self, retries: u32) -> Self {
        self.open_retries = retries.max(1);
        self
    }

    /// Set the sleep range between channel open attempts.
    pub fn with_open_backoff(mut self, backoff: BackoffRange) -> Self {
        self.open_backoff = backoff;
        self
    }

    /// Set the sleep range of the send/receive retry loops.
    pub fn with_io_backoff(mut self, backoff: BackoffRange) -> Self {
        self.io_backoff = backoff;
        self
    }

    /// Set the first-byte receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the per-peer dispatch budget and its lower bound.
    pub fn with_dispatch_slice(mut self, slice: Duration, min: Duration) -> Self {
        self.dispatch_slice = slice;
        self.min_dispatch_slice = min.min(slice);
        self
    }

    /// Timeouts handed to every channel opened under this configuration.
    pub fn channel_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            send_ready: self.send_ready_timeout,
            flush: self.flush_timeout,
            idle_gap: self.idle_gap,
            probe: self.probe_timeout,
        }
    }

    /// Per-peer receive budget for a blocking dispatch over `peers` peers.
    ///
    /// The budget shrinks as the number of peers grows so a full pass stays
    /// roughly bounded by `dispatch_slice`.
    pub fn slice_for(&self, peers: usize) -> Duration {
        let divisor = u32::try_from(peers.max(1)).unwrap_or(u32::MAX);
        (self.dispatch_slice / divisor).max(self.min_dispatch_slice)
    }
}

fn normalize_dir(dir: &Path) -> PathBuf {
    let raw = dir.to_string_lossy();
    let trimmed = raw.trim_end_matches([' ', '/']);
    if trimmed.is_empty() && raw.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}
