//! Single-task reactor: the only owner of the engine and of every socket.
//!
//! One `select!` loop multiplexes application commands, inbound streams,
//! inbound messages, link failures, beacons and the tick timer, then executes
//! the engine's actions in order.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use zre_core::{Action, DecodeError, MessageError, NodeId, ZreCore};

use crate::config::NodeConfig;
use crate::discovery::{self, RECV_BUF_SIZE};
use crate::log_sink::LogSink;
use crate::node::{Command, NodeError};
use crate::transport::{self, Inbound, LinkError, LinkFailure, PeerLink};

const INBOUND_QUEUE: usize = 1024;

pub(crate) struct Reactor {
    core: ZreCore,
    config: NodeConfig,
    host: IpAddr,
    discovery: Option<UdpSocket>,
    listener: Option<TcpListener>,
    log_sink: Option<LogSink>,
    links: HashMap<NodeId, PeerLink>,
    readers: JoinSet<()>,
    next_link: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<zre_core::Event>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    failed_tx: mpsc::UnboundedSender<LinkFailure>,
    failed_rx: mpsc::UnboundedReceiver<LinkFailure>,
    started: bool,
    stopped: bool,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: ZreCore,
        config: NodeConfig,
        host: IpAddr,
        discovery: UdpSocket,
        listener: TcpListener,
        log_sink: Option<LogSink>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<zre_core::Event>,
    ) -> io::Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let mut reactor = Self {
            core,
            config,
            host,
            discovery: Some(discovery),
            listener: None,
            log_sink,
            links: HashMap::new(),
            readers: JoinSet::new(),
            next_link: 0,
            commands,
            events,
            inbound_tx,
            inbound_rx,
            failed_tx,
            failed_rx,
            started: false,
            stopped: false,
        };
        reactor.install_listener(listener)?;
        Ok(reactor)
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = new_ticker(self.config.interval());
        let mut buf = [0u8; RECV_BUF_SIZE];
        info!(node = %self.core.identity(), endpoint = self.core.endpoint(), "reactor running");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        self.on_command(cmd, &mut ticker).await;
                        if self.stopped {
                            return;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                accepted = accept_on(&self.listener), if self.started => match accepted {
                    Ok((stream, from)) => self.spawn_reader(stream, from),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(msg) = self.inbound_rx.recv() => self.on_inbound(msg).await,
                Some(_) = self.readers.join_next(), if !self.readers.is_empty() => {}
                Some(failure) = self.failed_rx.recv() => self.on_link_failed(failure).await,
                received = recv_on(&self.discovery, &mut buf), if self.started => match received {
                    Ok((n, from)) => {
                        if let Some(beacon) = discovery::parse_datagram(&buf[..n], from) {
                            let actions = self.core.on_beacon(beacon, from.ip(), Instant::now());
                            self.execute(actions).await;
                        }
                    }
                    Err(e) => debug!(error = %e, "discovery receive failed"),
                },
                _ = ticker.tick(), if self.started => {
                    let actions = self.core.tick(Instant::now());
                    self.execute(actions).await;
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command, ticker: &mut Interval) {
        match cmd {
            Command::Name(reply) => {
                let _ = reply.send(self.core.name().to_string());
            }
            Command::SetName(name) => self.core.set_name(name),
            Command::SetHeader(key, value) => self.core.set_header(key, value),
            Command::SetEvasiveTimeout(d) => self.core.set_evasive_timeout(d),
            Command::SetExpiredTimeout(d) => self.core.set_expired_timeout(d),
            Command::SetInterval(d) => {
                self.config.interval_ms = d.as_millis() as u64;
                *ticker = new_ticker(d);
            }
            Command::SetBeaconsEnabled(enabled) => self.core.set_beacons_enabled(enabled),
            Command::SetDiscoveryPort(port, reply) => {
                // Old socket goes first so the same port can be rebound.
                self.discovery = None;
                let result = discovery::bind_discovery(port)
                    .map(|socket| {
                        self.config.discovery_port = port;
                        self.discovery = Some(socket);
                    })
                    .map_err(|source| NodeError::Bind {
                        what: "discovery socket",
                        source,
                    });
                let _ = reply.send(result);
            }
            Command::SetEndpoint(addr, reply) => {
                self.listener = None;
                let result = transport::bind_listener(addr.ip(), addr.port())
                    .and_then(|listener| {
                        if !addr.ip().is_unspecified() {
                            self.host = addr.ip();
                        }
                        self.install_listener(listener)
                    })
                    .map(|()| self.core.endpoint().to_string())
                    .map_err(|source| NodeError::Bind {
                        what: "data listener",
                        source,
                    });
                let _ = reply.send(result);
            }
            Command::Endpoint(reply) => {
                let _ = reply.send(self.core.endpoint().to_string());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.core.peers());
            }
            Command::PeersByGroup(group, reply) => {
                let _ = reply.send(self.core.peers_by_group(&group));
            }
            Command::Peer(id, reply) => {
                let _ = reply.send(self.core.peer(&id));
            }
            Command::PeerHeader(id, key, reply) => {
                let _ = reply.send(self.core.peer_header(&id, &key));
            }
            Command::OwnGroups(reply) => {
                let _ = reply.send(self.core.own_groups());
            }
            Command::Start => {
                if !self.started {
                    self.started = true;
                    // A fresh interval ticks immediately.
                    *ticker = new_ticker(self.config.interval());
                    info!(node = %self.core.identity(), "started");
                }
            }
            Command::Connect(addr, reply) => {
                let mut result = Ok(());
                for action in self.core.connect_to(addr) {
                    if let Action::Beacon { bytes, to } = action {
                        let dest = to.unwrap_or(addr);
                        if let Err(source) = send_beacon(&self.discovery, &bytes, dest).await {
                            result = Err(NodeError::Beacon { addr: dest, source });
                        }
                    }
                }
                let _ = reply.send(result);
            }
            Command::Join(group) => {
                let actions = self.core.join(&group);
                self.execute(actions).await;
            }
            Command::Leave(group) => {
                let actions = self.core.leave(&group);
                self.execute(actions).await;
            }
            Command::Whisper(peer, content) => {
                let actions = self.core.whisper(&peer, content);
                self.execute(actions).await;
            }
            Command::Shout(group, content) => {
                let actions = self.core.shout(&group, content);
                self.execute(actions).await;
            }
            Command::Stop(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_inbound(&mut self, msg: Inbound) {
        match self
            .core
            .on_message_received(msg.peer, &msg.frames, Instant::now())
        {
            Ok(actions) => self.execute(actions).await,
            Err(MessageError::Decode(DecodeError::Signature(sig))) => {
                trace!(peer = %msg.peer, signature = sig, "foreign message skipped")
            }
            Err(e) => debug!(peer = %msg.peer, error = %e, "message dropped"),
        }
    }

    async fn on_link_failed(&mut self, failure: LinkFailure) {
        let current = self.links.get(&failure.peer).map(PeerLink::id);
        if current != Some(failure.link) {
            trace!(peer = %failure.peer, link = failure.link, "stale link failure");
            return;
        }
        self.links.remove(&failure.peer);
        let actions = self.core.on_send_failed(&failure.peer);
        self.execute(actions).await;
    }

    /// Carry out engine actions in order. Follow-up actions (from a failed
    /// send) run after the current batch.
    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect { peer, endpoint } => {
                    self.next_link += 1;
                    let link = PeerLink::open(
                        self.next_link,
                        self.core.identity(),
                        peer,
                        &endpoint,
                        self.config.peer_hwm,
                        self.failed_tx.clone(),
                    );
                    self.links.insert(peer, link);
                }
                Action::Send { peer, frames } => {
                    let Some(link) = self.links.get(&peer) else {
                        trace!(peer = %peer, "no link, message dropped");
                        continue;
                    };
                    match link.send(&frames) {
                        Ok(()) => {}
                        Err(LinkError::Full) => {
                            warn!(peer = %peer, hwm = self.config.peer_hwm, "outbound queue full, message dropped")
                        }
                        Err(LinkError::Encode(e)) => {
                            warn!(peer = %peer, error = %e, "message not encodable, dropped")
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "send failed");
                            self.links.remove(&peer);
                            queue.extend(self.core.on_send_failed(&peer));
                        }
                    }
                }
                Action::Close { peer } => {
                    self.links.remove(&peer);
                }
                Action::Beacon { bytes, to } => {
                    let dest = to.unwrap_or_else(|| self.broadcast_addr());
                    if let Err(e) = send_beacon(&self.discovery, &bytes, dest).await {
                        debug!(%dest, error = %e, "beacon not sent");
                    }
                }
                Action::Emit(event) => {
                    trace!(kind = event.kind(), peer = %event.peer(), "event");
                    let _ = self.events.send(event);
                }
                Action::Log(record) => {
                    if let Some(sink) = &self.log_sink {
                        sink.publish(&record).await;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let actions = self.core.stop();
        self.execute(actions).await;
        self.links.clear();
        self.readers.abort_all();
        self.listener = None;
        self.discovery = None;
        self.started = false;
        self.stopped = true;
    }

    fn install_listener(&mut self, listener: TcpListener) -> io::Result<()> {
        let port = listener.local_addr()?.port();
        self.core.set_endpoint(SocketAddr::new(self.host, port));
        self.listener = Some(listener);
        debug!(endpoint = self.core.endpoint(), "data listener bound");
        Ok(())
    }

    fn spawn_reader(&mut self, stream: TcpStream, from: SocketAddr) {
        let inbound = self.inbound_tx.clone();
        self.readers.spawn(async move {
            if let Err(e) = transport::read_stream(stream, inbound).await {
                debug!(%from, error = %e, "inbound stream ended");
            }
        });
    }

    fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.config.broadcast), self.config.discovery_port)
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn send_beacon(socket: &Option<UdpSocket>, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
    match socket {
        Some(socket) => socket.send_to(bytes, dest).await.map(|_| ()),
        None => Err(io::Error::new(io::ErrorKind::NotConnected, "discovery socket closed")),
    }
}

async fn accept_on(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_on(socket: &Option<UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
