//! Single-direction named pipe endpoints.
//!
//! A [`Channel`] owns one FIFO file and one non-blocking descriptor. The
//! descriptor is opened read-write so that neither end blocks (or fails with
//! `ENXIO`) while the other side has not opened the pipe yet; the direction
//! is enforced by [`ChannelMode`] instead.
//!
//! There is no length prefix at this layer. A receive collects bytes until
//! the pipe stays silent for the idle gap, so a sender must write each frame
//! in one burst.

use crate::error::{Error, Result};
use crate::process::{Pid, current_pid};
use rustix::event::{PollFd, PollFlags, Timespec};
use rustix::fd::OwnedFd;
use rustix::fs::{FileType, Mode, OFlags};
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size of each read while draining a frame.
const READ_CHUNK: usize = 4096;

/// Direction of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Inbound: only `receive` and `is_data_available` work.
    Read,
    /// Outbound: only `send` works.
    Write,
}

/// Timing parameters of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Wait for the pipe to become writable before a send is abandoned.
    pub send_ready: Duration,
    /// Wait for buffer space while flushing the rest of a frame.
    pub flush: Duration,
    /// Silence after which an inbound frame is considered complete.
    pub idle_gap: Duration,
    /// Wait used by [`Channel::is_data_available`].
    pub probe: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            send_ready: Duration::from_secs(1),
            flush: Duration::from_secs(10),
            idle_gap: Duration::from_millis(22),
            probe: Duration::from_millis(15),
        }
    }
}

/// A named pipe endpoint.
///
/// # Example
///
/// ```rust,ignore
/// use forksync::channel::{Channel, ChannelMode};
///
/// let tx = Channel::open("/dev/shm/demo", ChannelMode::Write, true)?;
/// let rx = Channel::open("/dev/shm/demo", ChannelMode::Read, false)?;
///
/// assert!(tx.send(b"hello"));
/// assert_eq!(rx.receive(std::time::Duration::from_millis(100)), b"hello");
/// ```
#[derive(Debug)]
pub struct Channel {
    path: PathBuf,
    fd: OwnedFd,
    mode: ChannelMode,
    auto_delete: bool,
    opener: Pid,
    timeouts: ChannelTimeouts,
}

impl Channel {
    /// Create the FIFO if needed and open it with default timeouts.
    pub fn open(path: impl AsRef<Path>, mode: ChannelMode, auto_delete: bool) -> Result<Self> {
        Self::open_with(path, mode, auto_delete, ChannelTimeouts::default())
    }

    /// Create the FIFO if needed and open it non-blocking.
    ///
    /// With `auto_delete`, the FIFO file is unlinked when the channel is
    /// dropped by the process that opened it. Copies inherited by a forked
    /// child never unlink.
    pub fn open_with(
        path: impl AsRef<Path>,
        mode: ChannelMode,
        auto_delete: bool,
        timeouts: ChannelTimeouts,
    ) -> Result<Self> {
        let path = path.as_ref();
        let open_failed = |source| Error::ChannelOpenFailed {
            path: path.to_path_buf(),
            source,
        };

        match rustix::fs::mknodat(
            rustix::fs::CWD,
            path,
            FileType::Fifo,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::ROTH,
            0,
        ) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(e) => return Err(open_failed(e)),
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(open_failed)?;

        // A stale regular file under the same name would swallow writes.
        let stat = rustix::fs::fstat(&fd).map_err(open_failed)?;
        if FileType::from_raw_mode(stat.st_mode) != FileType::Fifo {
            if auto_delete {
                let _ = std::fs::remove_file(path);
            }
            return Err(open_failed(Errno::INVAL));
        }

        tracing::trace!(path = %path.display(), ?mode, "channel opened");

        Ok(Self {
            path: path.to_path_buf(),
            fd,
            mode,
            auto_delete,
            opener: current_pid(),
            timeouts,
        })
    }

    /// Path of the FIFO file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direction of this channel.
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Whether the FIFO file is unlinked on drop.
    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Change whether the FIFO file is unlinked on drop.
    pub fn set_auto_delete(&mut self, auto_delete: bool) {
        self.auto_delete = auto_delete;
    }

    /// Write a whole frame.
    ///
    /// Waits up to `send_ready` for the pipe to accept data, then keeps
    /// writing until every byte is out. Returns `false` on any failure or
    /// timeout; a `false` never means a partial frame was accepted as sent.
    pub fn send(&self, data: &[u8]) -> bool {
        if self.mode != ChannelMode::Write {
            return false;
        }
        if !self.wait_for(PollFlags::OUT, self.timeouts.send_ready) {
            return false;
        }

        let mut written = 0;
        while written < data.len() {
            match rustix::io::write(&self.fd, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::INTR) => {}
                Err(Errno::AGAIN) => {
                    if !self.wait_for(PollFlags::OUT, self.timeouts.flush) {
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "channel write failed");
                    return false;
                }
            }
        }
        true
    }

    /// Read one frame.
    ///
    /// Waits up to `timeout` for the first byte. An empty result means no
    /// data arrived, which is a normal condition rather than an error.
    pub fn receive(&self, timeout: Duration) -> Vec<u8> {
        let mut data = Vec::new();
        if self.mode != ChannelMode::Read || !self.wait_for(PollFlags::IN, timeout) {
            return data;
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match rustix::io::read(&self.fd, &mut chunk[..]) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(Errno::INTR) | Err(Errno::AGAIN) => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "channel read failed");
                    break;
                }
            }
            if !self.wait_for(PollFlags::IN, self.timeouts.idle_gap) {
                break;
            }
        }
        data
    }

    /// Check for pending inbound data without consuming it.
    pub fn is_data_available(&self) -> bool {
        self.mode == ChannelMode::Read && self.wait_for(PollFlags::IN, self.timeouts.probe)
    }

    fn wait_for(&self, flags: PollFlags, timeout: Duration) -> bool {
        let timeout = Timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let mut fds = [PollFd::new(&self.fd, flags)];
        loop {
            match rustix::event::poll(&mut fds, Some(&timeout)) {
                Ok(0) => return false,
                Ok(_) => return fds[0].revents().intersects(flags),
                Err(Errno::INTR) => {}
                Err(_) => return false,
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.auto_delete && self.opener == current_pid() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pair(dir: &Path, name: &str) -> (Channel, Channel) {
        let path = dir.join(name);
        let tx = Channel::open(&path, ChannelMode::Write, true).unwrap();
        let rx = Channel::open(&path, ChannelMode::Read, false).unwrap();
        (tx, rx)
    }

    #[test]
    fn test_open_creates_fifo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fifo");
        let _channel = Channel::open(&path, ChannelMode::Read, true).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_open_fails_in_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("fifo");
        let err = Channel::open(&path, ChannelMode::Write, false).unwrap_err();
        assert!(matches!(err, Error::ChannelOpenFailed { .. }));
    }

    #[test]
    fn test_open_rejects_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"not a pipe").unwrap();

        let err = Channel::open(&path, ChannelMode::Read, false).unwrap_err();
        assert!(matches!(err, Error::ChannelOpenFailed { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_send_receive() {
        let dir = tempdir().unwrap();
        let (tx, rx) = pair(dir.path(), "chan");

        assert!(tx.send(b"hello from pipe"));
        assert_eq!(rx.receive(Duration::from_millis(200)), b"hello from pipe");
    }

    #[test]
    fn test_receive_timeout_returns_empty() {
        let dir = tempdir().unwrap();
        let (_tx, rx) = pair(dir.path(), "quiet");

        assert!(rx.receive(Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn test_direction_is_enforced() {
        let dir = tempdir().unwrap();
        let (tx, rx) = pair(dir.path(), "dir");

        assert!(!rx.send(b"wrong way"));
        assert!(!tx.is_data_available());
        assert!(tx.receive(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_data_available_does_not_consume() {
        let dir = tempdir().unwrap();
        let (tx, rx) = pair(dir.path(), "peek");

        assert!(!rx.is_data_available());
        assert!(tx.send(b"peek"));
        assert!(rx.is_data_available());
        assert!(rx.is_data_available());
        assert_eq!(rx.receive(Duration::from_millis(100)), b"peek");
        assert!(!rx.is_data_available());
    }

    #[test]
    fn test_large_frame_is_reassembled() {
        let dir = tempdir().unwrap();
        let (tx, rx) = pair(dir.path(), "large");

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let reader = std::thread::spawn(move || rx.receive(Duration::from_secs(2)));
        assert!(tx.send(&payload));

        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_auto_delete_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");

        let channel = Channel::open(&path, ChannelMode::Write, true).unwrap();
        assert!(path.exists());
        drop(channel);
        assert!(!path.exists());
    }

    #[test]
    fn test_no_auto_delete_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kept");

        let channel = Channel::open(&path, ChannelMode::Read, false).unwrap();
        drop(channel);
        assert!(path.exists());
    }
}
