//! ZRE node: UDP beacon discovery, TCP peer transport and the reactor that
//! drives the protocol engine.

pub mod config;
pub mod discovery;
pub mod log_sink;
pub mod node;
mod reactor;
pub mod transport;

pub use config::NodeConfig;
pub use node::{Command, Node, NodeError};
pub use zre_core::{Event, NodeId, PeerInfo, PeerState};
