//! Key/value state of a critical section.

use crate::codec::Store;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// The two resource maps of a section.
///
/// The reliable map is lock-gated by the section; the unreliable map is not.
/// Values are opaque byte blobs. A full copy of both maps travels as the
/// READALL snapshot, serialized with rkyv.
#[derive(Clone, Debug, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceStore {
    reliable: BTreeMap<String, Vec<u8>>,
    unreliable: BTreeMap<String, Vec<u8>>,
}

impl ResourceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, store: Store) -> &BTreeMap<String, Vec<u8>> {
        match store {
            Store::Reliable => &self.reliable,
            Store::Unreliable => &self.unreliable,
        }
    }

    fn map_mut(&mut self, store: Store) -> &mut BTreeMap<String, Vec<u8>> {
        match store {
            Store::Reliable => &mut self.reliable,
            Store::Unreliable => &mut self.unreliable,
        }
    }

    /// Look up a value.
    pub fn get(&self, store: Store, name: &str) -> Option<&[u8]> {
        self.map(store).get(name).map(Vec::as_slice)
    }

    /// Whether a resource is present.
    pub fn contains(&self, store: Store, name: &str) -> bool {
        self.map(store).contains_key(name)
    }

    /// Insert or overwrite a value.
    pub fn insert(&mut self, store: Store, name: impl Into<String>, value: Vec<u8>) {
        self.map_mut(store).insert(name.into(), value);
    }

    /// Remove a value. Returns `true` if it was present.
    pub fn remove(&mut self, store: Store, name: &str) -> bool {
        self.map_mut(store).remove(name).is_some()
    }

    /// Mirror a read result: store the value if present, drop the key if not.
    pub fn refresh(&mut self, store: Store, name: &str, value: Option<Vec<u8>>) {
        match value {
            Some(value) => self.insert(store, name, value),
            None => {
                self.remove(store, name);
            }
        }
    }

    /// Resource names in sorted order.
    pub fn names(&self, store: Store) -> Vec<String> {
        self.map(store).keys().cloned().collect()
    }

    /// Serialize both maps.
    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.into_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a snapshot produced by [`ResourceStore::to_snapshot`].
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        // Frames arrive at arbitrary offsets; rkyv needs aligned input.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);

        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}
