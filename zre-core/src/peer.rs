//! Remote peer state machine: lifecycle, sequence counters, liveness deadlines.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::codec::{self, EncodeError};
use crate::identity::NodeId;
use crate::protocol::{Frame, ZreMessage};

/// Peer lifecycle. Ordered DISCONNECTED < CONNECTED < READY < EVASIVE < EXPIRING < EXPIRED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No transport.
    Disconnected,
    /// Transport open, HELLO not yet received.
    Connected,
    /// Handshake complete, deadlines active.
    Ready,
    /// Missed its silence deadline once; one PING goes out.
    Evasive,
    /// PING already sent; waiting for activity or final expiry.
    Expiring,
    /// Terminal; the engine removes the peer.
    Expired,
}

impl PeerState {
    fn rank(self) -> u8 {
        match self {
            PeerState::Disconnected => 0,
            PeerState::Connected => 1,
            PeerState::Ready => 2,
            PeerState::Evasive => 3,
            PeerState::Expiring => 4,
            PeerState::Expired => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Connected => "connected",
            PeerState::Ready => "ready",
            PeerState::Evasive => "evasive",
            PeerState::Expiring => "expiring",
            PeerState::Expired => "expired",
        }
    }
}

impl Ord for PeerState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for PeerState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State change produced by [`Peer::on_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    /// Newly evasive: the engine sends one PING.
    Evasive,
    Expiring,
    Expired,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("peer is disconnected")]
    Disconnected,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Read-only snapshot of a peer for application queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: NodeId,
    pub name: String,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub groups: Vec<String>,
    pub status: u8,
    pub state: PeerState,
}

/// One remote node. Owned and mutated only by the engine.
#[derive(Debug)]
pub struct Peer {
    identity: NodeId,
    name: String,
    endpoint: String,
    state: PeerState,
    status: u8,
    sent_sequence: u16,
    recv_sequence: u16,
    headers: BTreeMap<String, String>,
    groups: BTreeSet<String>,
    evasive_at: Instant,
    expired_at: Instant,
    /// Set once the application has seen an enter event for this peer.
    entered: bool,
}

impl Peer {
    pub fn new(identity: NodeId, now: Instant) -> Self {
        Self {
            identity,
            name: identity.to_string(),
            endpoint: String::new(),
            state: PeerState::Disconnected,
            status: 0,
            sent_sequence: 0,
            recv_sequence: 0,
            headers: BTreeMap::new(),
            groups: BTreeSet::new(),
            evasive_at: now,
            expired_at: now,
            entered: false,
        }
    }

    /// DISCONNECTED -> CONNECTED. The host opens the outbound link for `endpoint`.
    /// Returns false (and changes nothing) if the peer already has a transport.
    pub fn connect(&mut self, endpoint: &str) -> bool {
        if self.state != PeerState::Disconnected {
            return false;
        }
        self.endpoint = endpoint.to_string();
        self.state = PeerState::Connected;
        true
    }

    /// Any state -> DISCONNECTED. Returns true if a transport was open. Idempotent.
    pub fn disconnect(&mut self) -> bool {
        let was_connected = self.state != PeerState::Disconnected;
        self.state = PeerState::Disconnected;
        was_connected
    }

    /// HELLO received: CONNECTED/READY/EVASIVE/EXPIRING -> READY.
    pub fn on_handshake_received(&mut self) {
        if self.state >= PeerState::Connected && self.state < PeerState::Expired {
            self.state = PeerState::Ready;
        }
    }

    /// Refresh liveness deadlines. Activity from an EVASIVE or EXPIRING peer
    /// returns it to READY.
    pub fn on_activity(&mut self, now: Instant, evasive: Duration, expired: Duration) {
        if self.state == PeerState::Expired {
            return;
        }
        self.evasive_at = now + evasive;
        self.expired_at = now + expired;
        if matches!(self.state, PeerState::Evasive | PeerState::Expiring) {
            self.state = PeerState::Ready;
        }
    }

    /// Advance the liveness state machine once per tick.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        match self.state {
            PeerState::Disconnected | PeerState::Expired => TickOutcome::Unchanged,
            _ if now >= self.expired_at => {
                self.state = PeerState::Expired;
                TickOutcome::Expired
            }
            PeerState::Evasive => {
                self.state = PeerState::Expiring;
                TickOutcome::Expiring
            }
            PeerState::Ready if now >= self.evasive_at => {
                self.state = PeerState::Evasive;
                TickOutcome::Evasive
            }
            _ => TickOutcome::Unchanged,
        }
    }

    /// Accept `sequence` iff it is the modular successor of the last one received.
    pub fn is_valid_sequence(&mut self, sequence: u16) -> bool {
        let expected = self.recv_sequence.wrapping_add(1);
        if sequence == expected {
            self.recv_sequence = expected;
            true
        } else {
            false
        }
    }

    /// Stamp `msg` with the next sent sequence and encode it for the transport.
    pub fn send(&mut self, msg: ZreMessage) -> Result<Vec<Frame>, SendError> {
        if self.state == PeerState::Disconnected {
            return Err(SendError::Disconnected);
        }
        let next = self.sent_sequence.wrapping_add(1);
        let frames = codec::encode(&msg.with_sequence(next))?;
        self.sent_sequence = next;
        Ok(frames)
    }

    /// Bump the change counter after a group membership change.
    pub fn on_update(&mut self) {
        self.status = self.status.wrapping_add(1);
    }

    pub fn identity(&self) -> NodeId {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) {
        self.headers = headers;
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    pub(crate) fn groups_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.groups
    }

    pub fn evasive_at(&self) -> Instant {
        self.evasive_at
    }

    pub fn expired_at(&self) -> Instant {
        self.expired_at
    }

    pub fn has_entered(&self) -> bool {
        self.entered
    }

    pub(crate) fn mark_entered(&mut self) {
        self.entered = true;
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            identity: self.identity,
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            groups: self.groups.iter().cloned().collect(),
            status: self.status,
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    const EVASIVE: Duration = Duration::from_millis(5000);
    const EXPIRED: Duration = Duration::from_millis(10000);

    fn ready_peer(now: Instant) -> Peer {
        let mut p = Peer::new(NodeId::generate(), now);
        assert!(p.connect("127.0.0.1:49152"));
        p.on_handshake_received();
        p.on_activity(now, EVASIVE, EXPIRED);
        p
    }

    #[test]
    fn state_order_is_explicit() {
        use PeerState::*;
        let order = [Disconnected, Connected, Ready, Evasive, Expiring, Expired];
        for w in order.windows(2) {
            assert!(w[0] < w[1], "{} < {}", w[0], w[1]);
        }
    }

    #[test]
    fn connect_then_handshake() {
        let now = Instant::now();
        let mut p = Peer::new(NodeId::generate(), now);
        assert_eq!(p.state(), PeerState::Disconnected);
        assert_eq!(p.name(), p.identity().to_string());
        p.on_handshake_received();
        assert_eq!(p.state(), PeerState::Disconnected);
        assert!(p.connect("10.0.0.2:50000"));
        assert!(!p.connect("10.0.0.3:50000"));
        assert_eq!(p.endpoint(), "10.0.0.2:50000");
        assert_eq!(p.state(), PeerState::Connected);
        p.on_handshake_received();
        assert_eq!(p.state(), PeerState::Ready);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut p = ready_peer(Instant::now());
        assert!(p.disconnect());
        assert!(!p.disconnect());
        assert_eq!(p.state(), PeerState::Disconnected);
        assert_eq!(
            p.send(ZreMessage::Ping { sequence: 0 }),
            Err(SendError::Disconnected)
        );
    }

    #[test]
    fn sequence_validation_wraps() {
        let mut p = ready_peer(Instant::now());
        assert!(!p.is_valid_sequence(0));
        assert!(p.is_valid_sequence(1));
        assert!(!p.is_valid_sequence(1));
        assert!(!p.is_valid_sequence(3));
        assert!(p.is_valid_sequence(2));
        p.recv_sequence = 65535;
        assert!(p.is_valid_sequence(0));
        assert!(p.is_valid_sequence(1));
    }

    #[test]
    fn send_stamps_consecutive_sequences() {
        let mut p = ready_peer(Instant::now());
        for expected in 1..=3u16 {
            let frames = p.send(ZreMessage::Ping { sequence: 0 }).unwrap();
            assert_eq!(codec::decode(&frames).unwrap().sequence(), expected);
        }
        p.sent_sequence = 65535;
        let frames = p.send(ZreMessage::PingOk { sequence: 0 }).unwrap();
        assert_eq!(codec::decode(&frames).unwrap().sequence(), 0);
    }

    #[test]
    fn encode_failure_does_not_consume_sequence() {
        let mut p = ready_peer(Instant::now());
        let too_long = ZreMessage::Join {
            sequence: 0,
            group: "x".repeat(70_000),
            status: 0,
        };
        assert!(matches!(p.send(too_long), Err(SendError::Encode(_))));
        let frames = p.send(ZreMessage::Ping { sequence: 0 }).unwrap();
        assert_eq!(codec::decode(&frames).unwrap().sequence(), 1);
    }

    #[test]
    fn silence_goes_evasive_once_then_expiring_then_expired() {
        let t0 = Instant::now();
        let mut p = ready_peer(t0);
        assert_eq!(p.on_tick(t0 + Duration::from_millis(1000)), TickOutcome::Unchanged);
        assert_eq!(p.on_tick(t0 + Duration::from_millis(5000)), TickOutcome::Evasive);
        assert_eq!(p.state(), PeerState::Evasive);
        assert_eq!(p.on_tick(t0 + Duration::from_millis(6000)), TickOutcome::Expiring);
        for ms in [7000, 8000, 9000] {
            assert_eq!(p.on_tick(t0 + Duration::from_millis(ms)), TickOutcome::Unchanged);
            assert_eq!(p.state(), PeerState::Expiring);
        }
        assert_eq!(p.on_tick(t0 + Duration::from_millis(10000)), TickOutcome::Expired);
        assert_eq!(p.on_tick(t0 + Duration::from_millis(11000)), TickOutcome::Unchanged);
        assert_eq!(p.state(), PeerState::Expired);
    }

    #[test]
    fn activity_recovers_evasive_peer() {
        let t0 = Instant::now();
        let mut p = ready_peer(t0);
        p.on_tick(t0 + EVASIVE);
        p.on_tick(t0 + EVASIVE + Duration::from_millis(1000));
        assert_eq!(p.state(), PeerState::Expiring);
        let t1 = t0 + Duration::from_millis(7000);
        p.on_activity(t1, EVASIVE, EXPIRED);
        assert_eq!(p.state(), PeerState::Ready);
        assert_eq!(p.evasive_at(), t1 + EVASIVE);
        assert_eq!(p.expired_at(), t1 + EXPIRED);
        assert_eq!(p.on_tick(t0 + EXPIRED), TickOutcome::Unchanged);
    }

    #[test]
    fn connected_peer_only_expires() {
        let t0 = Instant::now();
        let mut p = Peer::new(NodeId::generate(), t0);
        p.connect("127.0.0.1:1");
        p.on_activity(t0, EVASIVE, EXPIRED);
        assert_eq!(p.on_tick(t0 + EVASIVE), TickOutcome::Unchanged);
        assert_eq!(p.state(), PeerState::Connected);
        assert_eq!(p.on_tick(t0 + EXPIRED), TickOutcome::Expired);
    }

    #[test]
    fn status_wraps() {
        let mut p = Peer::new(NodeId::generate(), Instant::now());
        p.set_status(255);
        p.on_update();
        assert_eq!(p.status(), 0);
    }
}
