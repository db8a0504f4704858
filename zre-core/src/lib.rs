//! ZRE proximity group messaging: protocol engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod beacon;
pub mod codec;
pub mod config;
pub mod engine;
pub mod event;
pub mod group;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use beacon::{Beacon, BeaconError, BEACON_SIZE};
pub use codec::{DecodeError, EncodeError};
pub use config::Config;
pub use engine::{Action, MessageError, ZreCore};
pub use event::Event;
pub use identity::NodeId;
pub use peer::{PeerInfo, PeerState};
pub use protocol::{Frame, LogMessage, MessageKind, ZreMessage, PROTOCOL_VERSION};
pub use wire::{FrameDecodeError, FrameEncodeError, MessageAssembler};
