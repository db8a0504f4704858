//! Application handle: commands in, events out.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use zre_core::{Event, NodeId, PeerInfo, ZreCore};

use crate::config::NodeConfig;
use crate::discovery;
use crate::log_sink::LogSink;
use crate::reactor::Reactor;
use crate::transport;

/// Requests from the application to the reactor. Queries carry their reply channel.
#[derive(Debug)]
pub enum Command {
    Name(oneshot::Sender<String>),
    SetName(String),
    SetHeader(String, String),
    SetEvasiveTimeout(Duration),
    SetExpiredTimeout(Duration),
    SetInterval(Duration),
    SetBeaconsEnabled(bool),
    SetDiscoveryPort(u16, oneshot::Sender<Result<(), NodeError>>),
    SetEndpoint(SocketAddr, oneshot::Sender<Result<String, NodeError>>),
    Endpoint(oneshot::Sender<String>),
    Peers(oneshot::Sender<Vec<NodeId>>),
    PeersByGroup(String, oneshot::Sender<Option<Vec<NodeId>>>),
    Peer(NodeId, oneshot::Sender<Option<PeerInfo>>),
    PeerHeader(NodeId, String, oneshot::Sender<Option<String>>),
    OwnGroups(oneshot::Sender<Vec<String>>),
    Start,
    Stop(oneshot::Sender<()>),
    Connect(SocketAddr, oneshot::Sender<Result<(), NodeError>>),
    Join(String),
    Leave(String),
    Whisper(NodeId, Vec<u8>),
    Shout(String, Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to send beacon to {addr}: {source}")]
    Beacon {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("node stopped")]
    Stopped,
}

/// A running node. Sockets are bound by [`Node::new`]; discovery and the
/// tick timer begin with [`Node::start`].
pub struct Node {
    identity: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    reactor: Option<JoinHandle<()>>,
}

impl Node {
    /// Bind the discovery and data sockets and spawn the reactor. Bind
    /// failures are fatal.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let identity = NodeId::generate();
        let discovery = discovery::bind_discovery(config.discovery_port).map_err(|source| {
            NodeError::Bind {
                what: "discovery socket",
                source,
            }
        })?;
        let listener = transport::bind_listener(config.bind_host, config.port).map_err(
            |source| NodeError::Bind {
                what: "data listener",
                source,
            },
        )?;
        let log_sink = match config.log_endpoint {
            Some(collector) => Some(LogSink::bind(collector).map_err(|source| NodeError::Bind {
                what: "log socket",
                source,
            })?),
            None => None,
        };
        let host: IpAddr = config
            .advertised_host
            .unwrap_or_else(|| discovery::detect_local_host(config.broadcast, config.discovery_port));

        let mut core = ZreCore::new(identity, config.engine_config());
        if let Some(name) = &config.name {
            core.set_name(name.clone());
        }
        for (key, value) in &config.headers {
            core.set_header(key.clone(), value.clone());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(core, config, host, discovery, listener, log_sink, cmd_rx, event_tx)
            .map_err(|source| NodeError::Bind {
                what: "data listener",
                source,
            })?;
        let handle = tokio::spawn(reactor.run());
        Ok(Self {
            identity,
            commands: cmd_tx,
            events: event_rx,
            reactor: Some(handle),
        })
    }

    pub fn identity(&self) -> NodeId {
        self.identity
    }

    /// Next event from the network; `None` once the node has stopped and
    /// every pending event was read.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn start(&self) -> Result<(), NodeError> {
        self.send(Command::Start)
    }

    /// Withdraw from the network, close every socket and wait for the reactor.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        self.query(Command::Stop).await?;
        if let Some(handle) = self.reactor.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    pub async fn name(&self) -> Result<String, NodeError> {
        self.query(Command::Name).await
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::SetName(name.into()))
    }

    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::SetHeader(key.into(), value.into()))
    }

    pub fn set_evasive_timeout(&self, timeout: Duration) -> Result<(), NodeError> {
        self.send(Command::SetEvasiveTimeout(timeout))
    }

    pub fn set_expired_timeout(&self, timeout: Duration) -> Result<(), NodeError> {
        self.send(Command::SetExpiredTimeout(timeout))
    }

    pub fn set_interval(&self, interval: Duration) -> Result<(), NodeError> {
        self.send(Command::SetInterval(interval))
    }

    pub fn set_beacons_enabled(&self, enabled: bool) -> Result<(), NodeError> {
        self.send(Command::SetBeaconsEnabled(enabled))
    }

    /// Rebind the discovery socket on another UDP port.
    pub async fn set_discovery_port(&self, port: u16) -> Result<(), NodeError> {
        self.query(|tx| Command::SetDiscoveryPort(port, tx)).await?
    }

    /// Rebind the data listener; returns the new advertised endpoint.
    pub async fn set_endpoint(&self, addr: SocketAddr) -> Result<String, NodeError> {
        self.query(|tx| Command::SetEndpoint(addr, tx)).await?
    }

    /// Advertised data endpoint, `host:port`.
    pub async fn endpoint(&self) -> Result<String, NodeError> {
        self.query(Command::Endpoint).await
    }

    pub async fn peers(&self) -> Result<Vec<NodeId>, NodeError> {
        self.query(Command::Peers).await
    }

    pub async fn peers_by_group(&self, group: impl Into<String>) -> Result<Option<Vec<NodeId>>, NodeError> {
        let group = group.into();
        self.query(|tx| Command::PeersByGroup(group, tx)).await
    }

    pub async fn peer(&self, id: NodeId) -> Result<Option<PeerInfo>, NodeError> {
        self.query(|tx| Command::Peer(id, tx)).await
    }

    pub async fn peer_header(&self, id: NodeId, key: impl Into<String>) -> Result<Option<String>, NodeError> {
        let key = key.into();
        self.query(|tx| Command::PeerHeader(id, key, tx)).await
    }

    pub async fn own_groups(&self) -> Result<Vec<String>, NodeError> {
        self.query(Command::OwnGroups).await
    }

    /// Send our beacon to `addr`, a discovery socket outside the broadcast domain.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NodeError> {
        self.query(|tx| Command::Connect(addr, tx)).await?
    }

    pub fn join(&self, group: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::Join(group.into()))
    }

    pub fn leave(&self, group: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::Leave(group.into()))
    }

    pub fn whisper(&self, peer: NodeId, content: impl Into<Vec<u8>>) -> Result<(), NodeError> {
        self.send(Command::Whisper(peer, content.into()))
    }

    pub fn shout(&self, group: impl Into<String>, content: impl Into<Vec<u8>>) -> Result<(), NodeError> {
        self.send(Command::Shout(group.into(), content.into()))
    }

    fn send(&self, cmd: Command) -> Result<(), NodeError> {
        self.commands.send(cmd).map_err(|_| NodeError::Stopped)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }
}
