//! Host-driven API: ZreCore receives events from host, returns actions.
//!
//! The host owns every socket and timer. It feeds the engine application
//! commands, inbound messages, beacons, send failures and periodic ticks, and
//! executes the returned [`Action`]s in order.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use crate::beacon::{Beacon, BEACON_SIZE};
use crate::codec::{self, DecodeError};
use crate::config::Config;
use crate::event::Event;
use crate::group::GroupRegistry;
use crate::identity::NodeId;
use crate::peer::{Peer, PeerInfo, PeerState, SendError, TickOutcome};
use crate::protocol::{Frame, LogEvent, LogLevel, LogMessage, MessageKind, ZreMessage};

/// Work for the host to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the outbound link to `peer`, greeting it with our identity.
    Connect { peer: NodeId, endpoint: String },
    /// Queue one encoded message on the peer's outbound link.
    Send { peer: NodeId, frames: Vec<Frame> },
    /// Drop the peer's outbound link.
    Close { peer: NodeId },
    /// Send a beacon datagram; `to: None` means the broadcast address.
    Beacon {
        bytes: [u8; BEACON_SIZE],
        to: Option<SocketAddr>,
    },
    /// Hand an event to the application.
    Emit(Event),
    /// Publish a record on the log channel, if one is configured.
    Log(LogMessage),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ZreCore {
    identity: NodeId,
    name: String,
    endpoint: String,
    port: u16,
    status: u8,
    headers: BTreeMap<String, String>,
    config: Config,
    peers: HashMap<NodeId, Peer>,
    peer_groups: GroupRegistry,
    own_groups: BTreeSet<String>,
}

impl ZreCore {
    pub fn new(identity: NodeId, config: Config) -> Self {
        Self {
            identity,
            name: identity.to_string(),
            endpoint: String::new(),
            port: 0,
            status: 0,
            headers: BTreeMap::new(),
            config,
            peers: HashMap::new(),
            peer_groups: GroupRegistry::new(),
            own_groups: BTreeSet::new(),
        }
    }

    pub fn identity(&self) -> NodeId {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Set a header sent in future HELLOs. Peers already connected keep the old value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Advertised data endpoint; its port goes into every beacon.
    pub fn set_endpoint(&mut self, addr: SocketAddr) {
        self.endpoint = addr.to_string();
        self.port = addr.port();
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_evasive_timeout(&mut self, timeout: Duration) {
        self.config.evasive_timeout = timeout;
    }

    pub fn set_expired_timeout(&mut self, timeout: Duration) {
        self.config.expired_timeout = timeout;
    }

    pub fn set_beacons_enabled(&mut self, enabled: bool) {
        self.config.beacons_enabled = enabled;
    }

    /// Our current beacon.
    pub fn beacon(&self) -> Beacon {
        Beacon::new(self.identity, self.port)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Members of a remote group, `None` if no peer ever referenced it.
    pub fn peers_by_group(&self, group: &str) -> Option<Vec<NodeId>> {
        self.peer_groups.peers_of(group)
    }

    pub fn peer(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.get(id).map(Peer::info)
    }

    pub fn peer_header(&self, id: &NodeId, key: &str) -> Option<String> {
        self.peers
            .get(id)
            .and_then(|p| p.header(key))
            .map(str::to_string)
    }

    pub fn own_groups(&self) -> Vec<String> {
        self.own_groups.iter().cloned().collect()
    }

    /// Join `group` and tell every peer. Joining twice is a no-op.
    pub fn join(&mut self, group: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.own_groups.insert(group.to_string()) {
            return actions;
        }
        self.status = self.status.wrapping_add(1);
        info!(group = %group, status = self.status, "joined group");
        let msg = ZreMessage::Join {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        };
        self.broadcast(msg, &mut actions);
        actions.push(self.log(LogLevel::Info, LogEvent::Join, None, group));
        actions
    }

    /// Leave `group` and tell every peer. Leaving a group we are not in is a no-op.
    pub fn leave(&mut self, group: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.own_groups.remove(group) {
            return actions;
        }
        self.status = self.status.wrapping_add(1);
        info!(group = %group, status = self.status, "left group");
        let msg = ZreMessage::Leave {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        };
        self.broadcast(msg, &mut actions);
        actions.push(self.log(LogLevel::Info, LogEvent::Leave, None, group));
        actions
    }

    /// Send `content` to one peer. Unknown peers are dropped silently.
    pub fn whisper(&mut self, peer: &NodeId, content: Vec<u8>) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.peers.get_mut(peer) {
            Some(p) => deliver(p, ZreMessage::Whisper { sequence: 0, content }, &mut actions),
            None => debug!(peer = %peer, "whisper to unknown peer dropped"),
        }
        actions
    }

    /// Send `content` to every member of a remote group. Unknown groups are dropped silently.
    pub fn shout(&mut self, group: &str, content: Vec<u8>) -> Vec<Action> {
        let mut actions = Vec::new();
        let msg = ZreMessage::Shout {
            sequence: 0,
            group: group.to_string(),
            content,
        };
        let peers = &mut self.peers;
        let known = self.peer_groups.fanout(group, |id| {
            if let Some(p) = peers.get_mut(&id) {
                deliver(p, msg.clone(), &mut actions);
            }
        });
        if !known {
            debug!(group = %group, "shout to unknown group dropped");
        }
        actions
    }

    /// Send our beacon to one address outside the broadcast domain.
    pub fn connect_to(&self, addr: SocketAddr) -> Vec<Action> {
        debug!(%addr, "unicast beacon");
        vec![Action::Beacon {
            bytes: self.beacon().encode(),
            to: Some(addr),
        }]
    }

    /// A valid beacon arrived from `from`.
    pub fn on_beacon(&mut self, beacon: Beacon, from: IpAddr, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let id = beacon.node_id;
        if id == self.identity {
            return actions;
        }
        if beacon.is_withdrawal() {
            if self.peers.contains_key(&id) {
                info!(peer = %id, "peer withdrew");
                self.remove_peer(&id, &mut actions);
            }
            return actions;
        }
        let endpoint = SocketAddr::new(from, beacon.port).to_string();
        let (evasive, expired) = (self.config.evasive_timeout, self.config.expired_timeout);
        let peer = self.require_peer(id, &endpoint, now, &mut actions);
        peer.on_activity(now, evasive, expired);
        actions
    }

    /// Process one inbound message from `sender` (the identity its stream greeted with).
    pub fn on_message_received(
        &mut self,
        sender: NodeId,
        frames: &[Frame],
        now: Instant,
    ) -> Result<Vec<Action>, MessageError> {
        let msg = codec::decode(frames)?;
        let mut actions = Vec::new();

        if let ZreMessage::Hello { endpoint, .. } = &msg {
            let peer = self.require_peer(sender, endpoint, now, &mut actions);
            peer.on_handshake_received();
        }

        let peer = self
            .peers
            .get_mut(&sender)
            .ok_or(MessageError::UnknownPeer(sender))?;
        if peer.state() < PeerState::Ready {
            return Err(MessageError::NotReady {
                peer: sender,
                kind: msg.kind(),
                state: peer.state(),
            });
        }
        if !peer.is_valid_sequence(msg.sequence()) {
            warn!(peer = %sender, kind = %msg.kind(), sequence = msg.sequence(), "lost messages from peer");
            let lost = self.log(LogLevel::Error, LogEvent::Other, Some(sender), "lost messages");
            actions.push(lost);
            self.remove_peer(&sender, &mut actions);
            return Ok(actions);
        }
        peer.on_activity(now, self.config.evasive_timeout, self.config.expired_timeout);
        let name = peer.name().to_string();

        match msg {
            ZreMessage::Hello {
                name,
                groups,
                status,
                headers,
                ..
            } => self.on_hello(sender, name, groups, status, headers, &mut actions),
            ZreMessage::Whisper { content, .. } => {
                actions.push(Action::Emit(Event::Whisper {
                    peer: sender,
                    name,
                    content,
                }));
            }
            ZreMessage::Shout { group, content, .. } => {
                actions.push(Action::Emit(Event::Shout {
                    peer: sender,
                    name,
                    group,
                    content,
                }));
            }
            ZreMessage::Join { group, status, .. } => {
                self.peer_groups.join(peer, &group);
                if peer.status() != status {
                    warn!(peer = %sender, local = peer.status(), remote = status, "peer status out of step");
                }
                debug!(peer = %sender, group = %group, "peer joined group");
                let log = self.log(LogLevel::Info, LogEvent::Join, Some(sender), &group);
                actions.push(Action::Emit(Event::Join {
                    peer: sender,
                    name,
                    group,
                }));
                actions.push(log);
            }
            ZreMessage::Leave { group, status, .. } => {
                self.peer_groups.leave(peer, &group);
                if peer.status() != status {
                    warn!(peer = %sender, local = peer.status(), remote = status, "peer status out of step");
                }
                debug!(peer = %sender, group = %group, "peer left group");
                let log = self.log(LogLevel::Info, LogEvent::Leave, Some(sender), &group);
                actions.push(Action::Emit(Event::Leave {
                    peer: sender,
                    name,
                    group,
                }));
                actions.push(log);
            }
            ZreMessage::Ping { .. } => {
                deliver(peer, ZreMessage::PingOk { sequence: 0 }, &mut actions);
            }
            ZreMessage::PingOk { .. } => trace!(peer = %sender, "ping answered"),
        }
        Ok(actions)
    }

    /// The host failed to hand a message to `peer`'s transport.
    pub fn on_send_failed(&mut self, peer: &NodeId) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.peers.contains_key(peer) {
            warn!(peer = %peer, "send failed, dropping peer");
            self.remove_peer(peer, &mut actions);
        }
        actions
    }

    /// Periodic tick: beacon, then advance every peer's liveness state.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.config.beacons_enabled {
            actions.push(Action::Beacon {
                bytes: self.beacon().encode(),
                to: None,
            });
        }

        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            match peer.on_tick(now) {
                TickOutcome::Expired => {
                    info!(peer = %id, "peer expired");
                    self.remove_peer(&id, &mut actions);
                }
                TickOutcome::Evasive => {
                    debug!(peer = %id, "peer evasive, sending ping");
                    deliver(peer, ZreMessage::Ping { sequence: 0 }, &mut actions);
                    if peer.has_entered() {
                        let name = peer.name().to_string();
                        actions.push(Action::Emit(Event::Evasive { peer: id, name }));
                        actions.push(self.log(LogLevel::Warning, LogEvent::Other, Some(id), "evasive"));
                    }
                }
                TickOutcome::Expiring | TickOutcome::Unchanged => {}
            }
        }
        actions
    }

    /// Withdraw from the network and drop every peer link.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.config.beacons_enabled {
            actions.push(Action::Beacon {
                bytes: Beacon::new(self.identity, 0).encode(),
                to: None,
            });
        }
        for (id, mut peer) in self.peers.drain() {
            self.peer_groups.remove_peer(&id);
            if peer.disconnect() {
                actions.push(Action::Close { peer: id });
            }
        }
        info!(node = %self.identity, "stopped");
        actions
    }

    fn hello(&self) -> ZreMessage {
        ZreMessage::Hello {
            sequence: 0,
            endpoint: self.endpoint.clone(),
            groups: self.own_groups.iter().cloned().collect(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Look up `id`, creating, connecting and greeting it if unknown. A new
    /// identity at an endpoint held by another peer replaces that peer.
    fn require_peer(
        &mut self,
        id: NodeId,
        endpoint: &str,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> &mut Peer {
        let hello = if self.peers.contains_key(&id) {
            None
        } else {
            let stale: Vec<NodeId> = self
                .peers
                .values()
                .filter(|p| p.endpoint() == endpoint)
                .map(Peer::identity)
                .collect();
            for old in stale {
                info!(peer = %old, replacement = %id, endpoint, "endpoint taken over by new identity");
                self.remove_peer(&old, actions);
            }
            Some(self.hello())
        };

        match self.peers.entry(id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let mut peer = Peer::new(id, now);
                peer.connect(endpoint);
                peer.on_activity(now, self.config.evasive_timeout, self.config.expired_timeout);
                actions.push(Action::Connect {
                    peer: id,
                    endpoint: endpoint.to_string(),
                });
                if let Some(hello) = hello {
                    deliver(&mut peer, hello, actions);
                }
                debug!(peer = %id, endpoint, "new peer");
                v.insert(peer)
            }
        }
    }

    fn on_hello(
        &mut self,
        sender: NodeId,
        name: String,
        groups: Vec<String>,
        status: u8,
        headers: BTreeMap<String, String>,
        actions: &mut Vec<Action>,
    ) {
        let Some(peer) = self.peers.get_mut(&sender) else {
            return;
        };
        peer.set_name(name.clone());
        peer.set_headers(headers.clone());
        let entering = !peer.has_entered();
        if entering {
            peer.mark_entered();
            info!(peer = %sender, name = %name, endpoint = peer.endpoint(), "peer entered");
            actions.push(Action::Emit(Event::Enter {
                peer: sender,
                name: name.clone(),
                endpoint: peer.endpoint().to_string(),
                headers,
            }));
        }
        for group in groups {
            self.peer_groups.join(peer, &group);
            actions.push(Action::Emit(Event::Join {
                peer: sender,
                name: name.clone(),
                group,
            }));
        }
        peer.set_status(status);
        if entering {
            actions.push(self.log(LogLevel::Info, LogEvent::Enter, Some(sender), &name));
        }
    }

    /// Remove a peer from the table and every group; exit event if it had entered.
    fn remove_peer(&mut self, id: &NodeId, actions: &mut Vec<Action>) {
        let Some(mut peer) = self.peers.remove(id) else {
            return;
        };
        self.peer_groups.remove_peer(id);
        if peer.disconnect() {
            actions.push(Action::Close { peer: *id });
        }
        if peer.has_entered() {
            info!(peer = %id, name = peer.name(), "peer exited");
            actions.push(Action::Emit(Event::Exit {
                peer: *id,
                name: peer.name().to_string(),
            }));
            actions.push(self.log(LogLevel::Info, LogEvent::Exit, Some(*id), peer.name()));
        }
    }

    fn broadcast(&mut self, msg: ZreMessage, actions: &mut Vec<Action>) {
        for peer in self.peers.values_mut() {
            deliver(peer, msg.clone(), actions);
        }
    }

    fn log(&self, level: LogLevel, event: LogEvent, peer: Option<NodeId>, data: &str) -> Action {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Action::Log(LogMessage {
            level,
            event,
            node: self.identity.short_hash(),
            peer: peer.map(|p| p.short_hash()).unwrap_or(0),
            time,
            data: data.to_string(),
        })
    }
}

/// Encode `msg` for `peer` and queue a send. Failures never stop the caller.
fn deliver(peer: &mut Peer, msg: ZreMessage, actions: &mut Vec<Action>) {
    let kind = msg.kind();
    match peer.send(msg) {
        Ok(frames) => actions.push(Action::Send {
            peer: peer.identity(),
            frames,
        }),
        Err(SendError::Disconnected) => {
            trace!(peer = %peer.identity(), %kind, "peer disconnected, message dropped")
        }
        Err(e) => warn!(peer = %peer.identity(), %kind, error = %e, "message not sent"),
    }
}

/// Why an inbound message was discarded.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),
    #[error("message from unknown peer {0}")]
    UnknownPeer(NodeId),
    #[error("{kind} from peer {peer} in state {state}")]
    NotReady {
        peer: NodeId,
        kind: MessageKind,
        state: PeerState,
    },
}
