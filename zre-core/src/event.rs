//! Application-facing events produced by the engine.

use std::collections::BTreeMap;

use crate::identity::NodeId;

/// One observable change in the peer network. `name` is the peer's display
/// name at the time of the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Handshake completed with a new peer.
    Enter {
        peer: NodeId,
        name: String,
        endpoint: String,
        headers: BTreeMap<String, String>,
    },
    /// Peer removed (expired, withdrew, lost messages or failed transport).
    Exit { peer: NodeId, name: String },
    Join {
        peer: NodeId,
        name: String,
        group: String,
    },
    Leave {
        peer: NodeId,
        name: String,
        group: String,
    },
    Whisper {
        peer: NodeId,
        name: String,
        content: Vec<u8>,
    },
    Shout {
        peer: NodeId,
        name: String,
        group: String,
        content: Vec<u8>,
    },
    /// Peer missed its silence deadline; a PING was sent. Not a removal.
    Evasive { peer: NodeId, name: String },
}

impl Event {
    pub fn peer(&self) -> NodeId {
        match self {
            Event::Enter { peer, .. }
            | Event::Exit { peer, .. }
            | Event::Join { peer, .. }
            | Event::Leave { peer, .. }
            | Event::Whisper { peer, .. }
            | Event::Shout { peer, .. }
            | Event::Evasive { peer, .. } => *peer,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Enter { .. } => "ENTER",
            Event::Exit { .. } => "EXIT",
            Event::Join { .. } => "JOIN",
            Event::Leave { .. } => "LEAVE",
            Event::Whisper { .. } => "WHISPER",
            Event::Shout { .. } => "SHOUT",
            Event::Evasive { .. } => "EVASIVE",
        }
    }
}
