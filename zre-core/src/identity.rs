//! Node identity: a random 128-bit identifier generated once per node.

use std::fmt;

/// Node identifier (16 bytes, random UUID v4). Carried in beacons and in the
/// stream greeting; rendered as 32 uppercase hex digits.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        NodeId(uuid::Uuid::new_v4().into_bytes())
    }

    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 16-bit fold of the identity, used as the `node`/`peer` field of LOG records.
    pub fn short_hash(&self) -> u16 {
        self.0
            .chunks_exact(2)
            .fold(0u16, |acc, pair| acc ^ u16::from_be_bytes([pair[0], pair[1]]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}
