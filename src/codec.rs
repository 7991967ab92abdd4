//! Wire format of critical-section messages.
//!
//! Every frame has a fixed-width, all-ASCII header:
//!
//! ```text
//! +--------+------------+----------+---------+----------------+
//! | opcode | sender pid | name len |  name   |     value      |
//! | 2 dig. |  10 digits | 4 digits | N bytes | remaining bytes|
//! +--------+------------+----------+---------+----------------+
//! ```
//!
//! A zero name length means the frame carries no name at all, which is
//! distinct from an empty name. The value is an opaque blob that runs to the
//! end of the frame.

use crate::error::{Error, Result};
use crate::process::Pid;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 2 + 10 + 4;

/// Longest name that fits the 4-digit length field.
pub const MAX_NAME_LEN: usize = 9999;

/// Message opcode.
///
/// Opcodes come in SYN/ACK/NACK triples: a request and its two possible
/// replies. The numeric value is the two-digit code on the wire.
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    AddOrUpdateSyn = 0,
    AddOrUpdateAck = 1,
    AddOrUpdateNack = 2,
    UnrelAddOrUpdateSyn = 3,
    UnrelAddOrUpdateAck = 4,
    UnrelAddOrUpdateNack = 5,
    EraseSyn = 6,
    EraseAck = 7,
    EraseNack = 8,
    UnrelEraseSyn = 9,
    UnrelEraseAck = 10,
    UnrelEraseNack = 11,
    ReadSyn = 12,
    ReadAck = 13,
    ReadNack = 14,
    UnrelReadSyn = 15,
    UnrelReadAck = 16,
    UnrelReadNack = 17,
    ReadAllSyn = 18,
    ReadAllAck = 19,
    ReadAllNack = 20,
    LockSyn = 21,
    LockAck = 22,
    LockNack = 23,
    UnlockSyn = 24,
    UnlockAck = 25,
    UnlockNack = 26,
}

impl Opcode {
    const ALL: [Opcode; 27] = [
        Opcode::AddOrUpdateSyn,
        Opcode::AddOrUpdateAck,
        Opcode::AddOrUpdateNack,
        Opcode::UnrelAddOrUpdateSyn,
        Opcode::UnrelAddOrUpdateAck,
        Opcode::UnrelAddOrUpdateNack,
        Opcode::EraseSyn,
        Opcode::EraseAck,
        Opcode::EraseNack,
        Opcode::UnrelEraseSyn,
        Opcode::UnrelEraseAck,
        Opcode::UnrelEraseNack,
        Opcode::ReadSyn,
        Opcode::ReadAck,
        Opcode::ReadNack,
        Opcode::UnrelReadSyn,
        Opcode::UnrelReadAck,
        Opcode::UnrelReadNack,
        Opcode::ReadAllSyn,
        Opcode::ReadAllAck,
        Opcode::ReadAllNack,
        Opcode::LockSyn,
        Opcode::LockAck,
        Opcode::LockNack,
        Opcode::UnlockSyn,
        Opcode::UnlockAck,
        Opcode::UnlockNack,
    ];

    /// Numeric code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up an opcode by its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Whether this opcode opens an exchange (a SYN).
    pub const fn is_request(self) -> bool {
        self.code() % 3 == 0
    }

    /// The positive reply to this opcode's exchange.
    pub fn ack(self) -> Self {
        Self::ALL[usize::from(self.code() - self.code() % 3 + 1)]
    }

    /// The negative reply to this opcode's exchange.
    pub fn nack(self) -> Self {
        Self::ALL[usize::from(self.code() - self.code() % 3 + 2)]
    }

    /// Mnemonic used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::AddOrUpdateSyn => "ADDORUPDATESYN",
            Opcode::AddOrUpdateAck => "ADDORUPDATEACK",
            Opcode::AddOrUpdateNack => "ADDORUPDATENACK",
            Opcode::UnrelAddOrUpdateSyn => "UNRELADDORUPDATESYN",
            Opcode::UnrelAddOrUpdateAck => "UNRELADDORUPDATEACK",
            Opcode::UnrelAddOrUpdateNack => "UNRELADDORUPDATENACK",
            Opcode::EraseSyn => "ERASESYN",
            Opcode::EraseAck => "ERASEACK",
            Opcode::EraseNack => "ERASENACK",
            Opcode::UnrelEraseSyn => "UNRELERASESYN",
            Opcode::UnrelEraseAck => "UNRELERASEACK",
            Opcode::UnrelEraseNack => "UNRELERASENACK",
            Opcode::ReadSyn => "READSYN",
            Opcode::ReadAck => "READACK",
            Opcode::ReadNack => "READNACK",
            Opcode::UnrelReadSyn => "UNRELREADSYN",
            Opcode::UnrelReadAck => "UNRELREADACK",
            Opcode::UnrelReadNack => "UNRELREADNACK",
            Opcode::ReadAllSyn => "READALLSYN",
            Opcode::ReadAllAck => "READALLACK",
            Opcode::ReadAllNack => "READALLNACK",
            Opcode::LockSyn => "LOCKSYN",
            Opcode::LockAck => "LOCKACK",
            Opcode::LockNack => "LOCKNACK",
            Opcode::UnlockSyn => "UNLOCKSYN",
            Opcode::UnlockAck => "UNLOCKACK",
            Opcode::UnlockNack => "UNLOCKNACK",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_code(value).ok_or_else(|| Error::InvalidFrame(format!("unknown opcode: {value:02}")))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Operation code.
    pub opcode: Opcode,
    /// Process that produced the frame.
    pub sender: Pid,
    /// Resource name, absent when the name length field is zero.
    pub name: Option<String>,
    /// Opaque value bytes.
    pub value: Vec<u8>,
}

impl Frame {
    /// Create a frame with no name and an empty value.
    pub fn new(opcode: Opcode, sender: Pid) -> Self {
        Self {
            opcode,
            sender,
            name: None,
            value: Vec::new(),
        }
    }

    /// Attach a resource name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a value.
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Serialize to wire bytes.
    ///
    /// An empty name is written with length zero and therefore decodes as
    /// absent.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_deref().unwrap_or("");
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "name too long: {} > {}",
                name.len(),
                MAX_NAME_LEN
            )));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + name.len() + self.value.len());
        out.extend_from_slice(
            format!("{:02}{:010}{:04}", self.opcode.code(), self.sender, name.len()).as_bytes(),
        );
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidFrame(format!(
                "frame too short: {} < {}",
                bytes.len(),
                HEADER_LEN
            )));
        }

        let opcode = Opcode::try_from(parse_digits(&bytes[0..2], "opcode")? as u8)?;
        let sender = u32::try_from(parse_digits(&bytes[2..12], "sender pid")?)
            .map_err(|_| Error::InvalidFrame("sender pid out of range".into()))?;
        let name_len = parse_digits(&bytes[12..16], "name length")? as usize;

        let body = &bytes[HEADER_LEN..];
        if body.len() < name_len {
            return Err(Error::InvalidFrame(format!(
                "name truncated: {} < {}",
                body.len(),
                name_len
            )));
        }

        let name = if name_len == 0 {
            None
        } else {
            let raw = body[..name_len].to_vec();
            Some(
                String::from_utf8(raw)
                    .map_err(|_| Error::InvalidFrame("name is not valid UTF-8".into()))?,
            )
        };

        Ok(Self {
            opcode,
            sender,
            name,
            value: body[name_len..].to_vec(),
        })
    }
}

fn parse_digits(field: &[u8], what: &str) -> Result<u64> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidFrame(format!("{what} is not a decimal field")));
    }
    Ok(field
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0')))
}

/// Which of a section's two stores an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Store {
    /// Lock-gated store.
    Reliable,
    /// Ungated, best-effort store.
    Unreliable,
}

/// A client request, decoded from a SYN frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Insert or overwrite a resource.
    AddOrUpdate {
        /// Target store.
        store: Store,
        /// Resource name.
        name: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove a resource.
    Erase {
        /// Target store.
        store: Store,
        /// Resource name.
        name: String,
    },
    /// Read one resource.
    Read {
        /// Target store.
        store: Store,
        /// Resource name.
        name: String,
    },
    /// Read a snapshot of both stores.
    ReadAll,
    /// Acquire the section lock.
    Lock,
    /// Release the section lock.
    Unlock,
}

impl Request {
    /// The SYN opcode for this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::AddOrUpdate {
                store: Store::Reliable,
                ..
            } => Opcode::AddOrUpdateSyn,
            Request::AddOrUpdate {
                store: Store::Unreliable,
                ..
            } => Opcode::UnrelAddOrUpdateSyn,
            Request::Erase {
                store: Store::Reliable,
                ..
            } => Opcode::EraseSyn,
            Request::Erase {
                store: Store::Unreliable,
                ..
            } => Opcode::UnrelEraseSyn,
            Request::Read {
                store: Store::Reliable,
                ..
            } => Opcode::ReadSyn,
            Request::Read {
                store: Store::Unreliable,
                ..
            } => Opcode::UnrelReadSyn,
            Request::ReadAll => Opcode::ReadAllSyn,
            Request::Lock => Opcode::LockSyn,
            Request::Unlock => Opcode::UnlockSyn,
        }
    }

    /// Build the SYN frame for this request.
    pub fn into_frame(self, sender: Pid) -> Frame {
        let frame = Frame::new(self.opcode(), sender);
        match self {
            Request::AddOrUpdate { name, value, .. } => frame.with_name(name).with_value(value),
            Request::Erase { name, .. } | Request::Read { name, .. } => frame.with_name(name),
            Request::ReadAll | Request::Lock | Request::Unlock => frame,
        }
    }

    /// Decode a SYN frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let named = |frame: Frame| -> Result<(String, Vec<u8>)> {
            match frame.name {
                Some(name) => Ok((name, frame.value)),
                None => Err(Error::InvalidFrame(format!(
                    "{} requires a resource name",
                    frame.opcode
                ))),
            }
        };

        let opcode = frame.opcode;
        match opcode {
            Opcode::AddOrUpdateSyn | Opcode::UnrelAddOrUpdateSyn => {
                let (name, value) = named(frame)?;
                Ok(Request::AddOrUpdate {
                    store: store_of(opcode),
                    name,
                    value,
                })
            }
            Opcode::EraseSyn | Opcode::UnrelEraseSyn => Ok(Request::Erase {
                store: store_of(opcode),
                name: named(frame)?.0,
            }),
            Opcode::ReadSyn | Opcode::UnrelReadSyn => Ok(Request::Read {
                store: store_of(opcode),
                name: named(frame)?.0,
            }),
            Opcode::ReadAllSyn => Ok(Request::ReadAll),
            Opcode::LockSyn => Ok(Request::Lock),
            Opcode::UnlockSyn => Ok(Request::Unlock),
            other => Err(Error::InvalidFrame(format!("{other} is not a request"))),
        }
    }
}

fn store_of(opcode: Opcode) -> Store {
    match opcode {
        Opcode::UnrelAddOrUpdateSyn | Opcode::UnrelEraseSyn | Opcode::UnrelReadSyn => {
            Store::Unreliable
        }
        _ => Store::Reliable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(Opcode::try_from(12).unwrap(), 4242)
            .with_name("res1")
            .with_value(vec![0xAB, 0xCD]);

        let encoded = frame.encode().unwrap();
        assert_eq!(&encoded[..16], b"1200000042420004");

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.opcode.code(), 12);
        assert_eq!(decoded.sender, 4242);
        assert_eq!(decoded.name.as_deref(), Some("res1"));
        assert_eq!(decoded.value, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_zero_name_length_decodes_as_absent() {
        let decoded = Frame::decode(b"210000000007000").unwrap_err();
        assert!(matches!(decoded, Error::InvalidFrame(_)));

        let decoded = Frame::decode(b"2100000000070000").unwrap();
        assert_eq!(decoded.opcode, Opcode::LockSyn);
        assert_eq!(decoded.sender, 7);
        assert_eq!(decoded.name, None);
        assert!(decoded.value.is_empty());

        let empty_name = Frame::new(Opcode::ReadSyn, 1).with_name("");
        let decoded = Frame::decode(&empty_name.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode(b"xx00000000010000").is_err());
        assert!(Frame::decode(b"9900000000010000").is_err());
        assert!(Frame::decode(b"120000000001000a").is_err());
        // Name length longer than the body.
        assert!(Frame::decode(b"1200000000010009abc").is_err());
    }

    #[test]
    fn test_encode_rejects_long_name() {
        let frame = Frame::new(Opcode::ReadSyn, 1).with_name("n".repeat(MAX_NAME_LEN + 1));
        assert!(frame.encode().is_err());

        let frame = Frame::new(Opcode::ReadSyn, 1).with_name("n".repeat(MAX_NAME_LEN));
        assert_eq!(frame.encode().unwrap().len(), HEADER_LEN + MAX_NAME_LEN);
    }

    #[test]
    fn test_value_may_contain_header_like_bytes() {
        let frame = Frame::new(Opcode::AddOrUpdateSyn, 99)
            .with_name("k")
            .with_value(b"0000000000000000".to_vec());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_opcode_triples() {
        assert!(Opcode::LockSyn.is_request());
        assert!(!Opcode::LockAck.is_request());
        assert_eq!(Opcode::LockSyn.ack(), Opcode::LockAck);
        assert_eq!(Opcode::LockSyn.nack(), Opcode::LockNack);
        assert_eq!(Opcode::UnrelReadSyn.ack(), Opcode::UnrelReadAck);
        assert_eq!(Opcode::UnlockNack.ack(), Opcode::UnlockAck);

        for code in 0..27u8 {
            assert_eq!(Opcode::from_code(code).unwrap().code(), code);
        }
        assert!(Opcode::from_code(27).is_none());
    }

    #[test]
    fn test_request_frame_mapping() {
        let request = Request::AddOrUpdate {
            store: Store::Unreliable,
            name: "counter".into(),
            value: vec![1, 2, 3],
        };
        let frame = request.clone().into_frame(10);
        assert_eq!(frame.opcode, Opcode::UnrelAddOrUpdateSyn);
        assert_eq!(Request::from_frame(frame).unwrap(), request);

        let frame = Request::Lock.into_frame(10);
        assert_eq!(Request::from_frame(frame).unwrap(), Request::Lock);
    }

    #[test]
    fn test_request_requires_name() {
        let frame = Frame::new(Opcode::EraseSyn, 3);
        assert!(Request::from_frame(frame).is_err());
    }

    #[test]
    fn test_reply_is_not_a_request() {
        let frame = Frame::new(Opcode::LockAck, 3);
        assert!(Request::from_frame(frame).is_err());
    }
}
