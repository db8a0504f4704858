//! UDP discovery beacon: `tag[3]="ZRE" | version[1]=1 | node_id[16] | port[2 BE]`.

use crate::identity::NodeId;

pub const BEACON_SIZE: usize = 22;
pub const BEACON_TAG: &[u8; 3] = b"ZRE";
pub const BEACON_VERSION: u8 = 1;

/// Decoded discovery beacon. `port == 0` is a withdrawal: the sender is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub node_id: NodeId,
    pub port: u16,
}

impl Beacon {
    pub fn new(node_id: NodeId, port: u16) -> Self {
        Beacon { node_id, port }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.port == 0
    }

    pub fn encode(&self) -> [u8; BEACON_SIZE] {
        let mut out = [0u8; BEACON_SIZE];
        out[..3].copy_from_slice(BEACON_TAG);
        out[3] = BEACON_VERSION;
        out[4..20].copy_from_slice(self.node_id.as_bytes());
        out[20..22].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Parse a received datagram. Self-beacons are not filtered here.
    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        if bytes.len() != BEACON_SIZE {
            return Err(BeaconError::Length(bytes.len()));
        }
        if &bytes[..3] != BEACON_TAG {
            return Err(BeaconError::Tag);
        }
        if bytes[3] != BEACON_VERSION {
            return Err(BeaconError::Version(bytes[3]));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[4..20]);
        Ok(Beacon {
            node_id: NodeId::from_bytes(id),
            port: u16::from_be_bytes([bytes[20], bytes[21]]),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("beacon is {0} bytes, expected 22")]
    Length(usize),
    #[error("unknown protocol tag")]
    Tag,
    #[error("unsupported beacon version {0}")]
    Version(u8),
}
