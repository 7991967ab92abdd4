//! Paired channels between two processes.
//!
//! A [`Link`] connects this process with one peer for one section. It owns
//! an outbound channel (`s{me}-d{peer}`) and an inbound one
//! (`s{peer}-d{me}`), and it retries transport failures for as long as the
//! peer process is alive. Once the peer is gone every operation fails fast.

use crate::channel::{Channel, ChannelMode, ChannelTimeouts};
use crate::codec::{Frame, Opcode};
use crate::config::{BackoffRange, SectionConfig};
use crate::error::{Error, Result};
use crate::gc::PipeName;
use crate::process::{Pid, current_pid, is_alive};
use crate::section::SectionId;
use std::path::Path;
use std::time::Duration;

/// Bidirectional, liveness-aware connection to one peer process.
#[derive(Debug)]
pub struct Link {
    read: Option<Channel>,
    write: Option<Channel>,
    peer: Option<Pid>,
    me: Pid,
    io_backoff: BackoffRange,
    receive_timeout: Duration,
}

impl Link {
    /// Open both channels of a link, retrying each with randomized backoff.
    ///
    /// The outbound pipe is always removed by this process on drop. The
    /// inbound pipe is removed only when `owns_inbound` is set, which the
    /// section creator does and forked clients do not.
    pub fn establish(
        config: &SectionConfig,
        section: SectionId,
        peer: Pid,
        owns_inbound: bool,
    ) -> Result<Self> {
        let me = current_pid();
        let timeouts = config.channel_timeouts();

        let outbound = PipeName::new(section.as_u64(), me, peer).path_in(&config.pipe_dir);
        let write = open_with_retry(config, &outbound, ChannelMode::Write, true, timeouts)?;

        let inbound = PipeName::new(section.as_u64(), peer, me).path_in(&config.pipe_dir);
        let read = open_with_retry(config, &inbound, ChannelMode::Read, owns_inbound, timeouts)?;

        tracing::debug!(section = %section, me, peer, "link established");

        Ok(Self::from_channels(read, write, peer, config))
    }

    /// Assemble a link from already opened channels.
    pub fn from_channels(read: Channel, write: Channel, peer: Pid, config: &SectionConfig) -> Self {
        Self {
            read: Some(read),
            write: Some(write),
            peer: Some(peer),
            me: current_pid(),
            io_backoff: config.io_backoff,
            receive_timeout: config.receive_timeout,
        }
    }

    /// Process on the other end.
    pub fn peer(&self) -> Option<Pid> {
        self.peer
    }

    /// True if a channel is missing, the peer is unknown, or the peer is dead.
    pub fn is_broken(&self) -> bool {
        match (&self.read, &self.write, self.peer) {
            (Some(_), Some(_), Some(peer)) => !is_alive(peer),
            _ => true,
        }
    }

    fn broken(&self) -> Error {
        Error::LinkBroken(self.peer.unwrap_or(0))
    }

    /// Encode and send one operation. See [`Link::send_frame`].
    pub fn send_operation(&self, opcode: Opcode, name: Option<&str>, value: &[u8]) -> bool {
        let mut frame = Frame::new(opcode, self.me).with_value(value);
        if let Some(name) = name {
            frame = frame.with_name(name);
        }
        self.send_frame(&frame)
    }

    /// Send one frame, retrying while the peer is alive.
    ///
    /// Returns `false` once the peer is found dead or the frame cannot be
    /// encoded.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        let (Some(write), Some(peer)) = (&self.write, self.peer) else {
            return false;
        };
        if self.is_broken() {
            return false;
        }

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable frame");
                return false;
            }
        };

        tracing::trace!(
            me = self.me,
            peer,
            opcode = %frame.opcode,
            name = ?frame.name,
            value_len = frame.value.len(),
            "sending frame"
        );

        loop {
            if write.send(&bytes) {
                return true;
            }
            if !is_alive(peer) {
                tracing::debug!(peer, opcode = %frame.opcode, "peer died during send");
                return false;
            }
            self.io_backoff.sleep();
        }
    }

    /// Receive one frame, waiting while the peer is alive.
    pub fn receive_operation(&self) -> Result<Frame> {
        let (Some(read), Some(peer)) = (&self.read, self.peer) else {
            return Err(self.broken());
        };
        if self.is_broken() {
            return Err(self.broken());
        }

        loop {
            let data = read.receive(self.receive_timeout);
            if !data.is_empty() {
                return self.decode(&data);
            }
            if !is_alive(peer) {
                tracing::debug!(peer, "peer died during receive");
                return Err(Error::LinkBroken(peer));
            }
            self.io_backoff.sleep();
        }
    }

    /// Receive at most one frame within `timeout`.
    ///
    /// `Ok(None)` means the peer is alive but quiet.
    pub fn try_receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        let Some(read) = &self.read else {
            return Err(self.broken());
        };
        if self.is_broken() {
            return Err(self.broken());
        }

        let data = read.receive(timeout);
        if data.is_empty() {
            return Ok(None);
        }
        self.decode(&data).map(Some)
    }

    fn decode(&self, data: &[u8]) -> Result<Frame> {
        let frame = Frame::decode(data)?;
        tracing::trace!(
            me = self.me,
            sender = frame.sender,
            opcode = %frame.opcode,
            name = ?frame.name,
            value_len = frame.value.len(),
            "received frame"
        );
        Ok(frame)
    }

    /// Whether inbound data is waiting, without consuming it.
    pub fn is_data_available(&self) -> bool {
        self.read.as_ref().is_some_and(Channel::is_data_available)
    }

    /// Drop both channels. The link is broken afterwards.
    pub fn close(&mut self) {
        self.read = None;
        self.write = None;
        self.peer = None;
    }
}

fn open_with_retry(
    config: &SectionConfig,
    path: &Path,
    mode: ChannelMode,
    auto_delete: bool,
    timeouts: ChannelTimeouts,
) -> Result<Channel> {
    let mut attempt = 1;
    loop {
        match Channel::open_with(path, mode, auto_delete, timeouts) {
            Ok(channel) => return Ok(channel),
            Err(e) if attempt >= config.open_retries => {
                tracing::warn!(path = %path.display(), attempts = attempt, error = %e, "giving up on channel");
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), attempt, error = %e, "channel open failed, retrying");
                attempt += 1;
                config.open_backoff.sleep();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_config(dir: &Path) -> SectionConfig {
        SectionConfig::default()
            .with_pipe_dir(dir)
            .with_open_retries(2)
            .with_open_backoff(BackoffRange::from_millis(1, 2))
            .with_io_backoff(BackoffRange::from_millis(1, 5))
            .with_receive_timeout(Duration::from_millis(50))
    }

    /// Two ends of a loopback link inside the test process.
    fn loopback(dir: &Path) -> (Link, Link) {
        let config = fast_config(dir);
        let me = current_pid();
        let ab = dir.join("a-to-b");
        let ba = dir.join("b-to-a");

        let a = Link::from_channels(
            Channel::open(&ba, ChannelMode::Read, true).unwrap(),
            Channel::open(&ab, ChannelMode::Write, true).unwrap(),
            me,
            &config,
        );
        let b = Link::from_channels(
            Channel::open(&ab, ChannelMode::Read, false).unwrap(),
            Channel::open(&ba, ChannelMode::Write, false).unwrap(),
            me,
            &config,
        );
        (a, b)
    }

    #[test]
    fn test_operation_roundtrip() {
        let dir = tempdir().unwrap();
        let (a, b) = loopback(dir.path());

        assert!(a.send_operation(Opcode::AddOrUpdateSyn, Some("res"), b"value"));
        let frame = b.receive_operation().unwrap();
        assert_eq!(frame.opcode, Opcode::AddOrUpdateSyn);
        assert_eq!(frame.sender, current_pid());
        assert_eq!(frame.name.as_deref(), Some("res"));
        assert_eq!(frame.value, b"value");

        assert!(b.send_operation(Opcode::AddOrUpdateAck, Some("res"), &[]));
        assert_eq!(a.receive_operation().unwrap().opcode, Opcode::AddOrUpdateAck);
    }

    #[test]
    fn test_try_receive_quiet_peer() {
        let dir = tempdir().unwrap();
        let (a, b) = loopback(dir.path());

        assert!(!b.is_data_available());
        assert!(b.try_receive(Duration::from_millis(10)).unwrap().is_none());

        assert!(a.send_operation(Opcode::LockSyn, None, &[]));
        assert!(b.is_data_available());
        let frame = b.try_receive(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::LockSyn);
        assert_eq!(frame.name, None);
    }

    #[test]
    fn test_dead_peer_breaks_link() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let link = Link::from_channels(
            Channel::open(dir.path().join("in"), ChannelMode::Read, true).unwrap(),
            Channel::open(dir.path().join("out"), ChannelMode::Write, true).unwrap(),
            u32::MAX,
            &config,
        );

        assert!(link.is_broken());
        assert!(!link.send_operation(Opcode::LockSyn, None, &[]));
        assert!(matches!(link.receive_operation(), Err(Error::LinkBroken(_))));
        assert!(matches!(
            link.try_receive(Duration::from_millis(1)),
            Err(Error::LinkBroken(_))
        ));
    }

    #[test]
    fn test_closed_link_is_broken() {
        let dir = tempdir().unwrap();
        let (mut a, _b) = loopback(dir.path());

        assert!(!a.is_broken());
        a.close();
        assert!(a.is_broken());
        assert_eq!(a.peer(), None);
        assert!(!a.send_operation(Opcode::UnlockSyn, None, &[]));
    }

    #[test]
    fn test_establish_uses_pipe_convention() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let section = SectionId::from_raw(77);
        let me = current_pid();

        let link = Link::establish(&config, section, me, true).unwrap();
        let expected = dir.path().join(format!("gphpthread_77_s{me}-d{me}"));
        assert!(expected.exists());

        drop(link);
        assert!(!expected.exists());
    }

    #[test]
    fn test_client_keeps_inbound_pipe() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let section = SectionId::from_raw(78);
        let me = current_pid();
        // Peer pid differs from ours so the two pipes are distinct files.
        let peer = 1;

        let link = Link::establish(&config, section, peer, false).unwrap();
        let outbound = dir.path().join(format!("gphpthread_78_s{me}-d{peer}"));
        let inbound = dir.path().join(format!("gphpthread_78_s{peer}-d{me}"));
        assert!(outbound.exists());
        assert!(inbound.exists());

        drop(link);
        assert!(!outbound.exists());
        assert!(inbound.exists());
    }

    #[test]
    fn test_establish_fails_without_directory() {
        let dir = tempdir().unwrap();
        let config = fast_config(&dir.path().join("missing"));

        let err = Link::establish(&config, SectionId::from_raw(1), 1, true).unwrap_err();
        assert!(matches!(err, Error::ChannelOpenFailed { .. }));
    }
}
