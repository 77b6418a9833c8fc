//! The ring: ordered registry of every node in the session

use crate::crypto::PublicKey;
use crate::error::{BlockchatError, NetworkError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a node in the ring. `0` is the bootstrap node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const BOOTSTRAP: NodeId = NodeId(0);

    pub fn is_bootstrap(&self) -> bool {
        *self == Self::BOOTSTRAP
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingEntry {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub public_key: PublicKey,
}

impl RingEntry {
    /// `ip:port` used by transports
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Registration-ordered ring with O(1) lookup by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RingEntry>", into = "Vec<RingEntry>")]
pub struct Ring {
    entries: IndexMap<NodeId, RingEntry>,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; its id is the current ring size.
    pub fn register(&mut self, ip: impl Into<String>, port: u16, public_key: PublicKey) -> NodeId {
        let id = NodeId(self.entries.len() as u32);
        self.entries.insert(
            id,
            RingEntry {
                id,
                ip: ip.into(),
                port,
                public_key,
            },
        );
        id
    }

    /// Like [`Ring::register`], but refuses once `total` nodes are present.
    pub fn register_bounded(
        &mut self,
        ip: impl Into<String>,
        port: u16,
        public_key: PublicKey,
        total: usize,
    ) -> Result<NodeId> {
        if self.is_complete(total) {
            return Err(NetworkError::RingFull { total }.into());
        }
        Ok(self.register(ip, port, public_key))
    }

    /// Build a ring from a received entry list, checking ids are 0..n in order.
    pub fn from_entries(entries: Vec<RingEntry>) -> Result<Self> {
        let mut ring = Ring::new();
        for (position, entry) in entries.into_iter().enumerate() {
            if entry.id.0 as usize != position {
                return Err(BlockchatError::config(format!(
                    "ring entry at position {} has id {}",
                    position, entry.id
                )));
            }
            ring.entries.insert(entry.id, entry);
        }
        Ok(ring)
    }

    pub fn get(&self, id: NodeId) -> Option<&RingEntry> {
        self.entries.get(&id)
    }

    pub fn find_by_public_key(&self, public_key: &PublicKey) -> Option<&RingEntry> {
        self.entries.values().find(|entry| &entry.public_key == public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RingEntry> {
        self.entries.values()
    }

    pub fn entries(&self) -> Vec<RingEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_complete(&self, total: usize) -> bool {
        self.entries.len() >= total
    }
}

impl TryFrom<Vec<RingEntry>> for Ring {
    type Error = BlockchatError;

    fn try_from(entries: Vec<RingEntry>) -> Result<Self> {
        Ring::from_entries(entries)
    }
}

impl From<Ring> for Vec<RingEntry> {
    fn from(ring: Ring) -> Self {
        ring.entries.into_values().collect()
    }
}
