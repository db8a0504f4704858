//! LAN discovery socket: UDP broadcast beacons on the well-known port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use zre_core::{Beacon, BeaconError, BEACON_SIZE};

/// Bind the discovery port with address reuse so several nodes can share a host.
pub fn bind_discovery(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    let std_sock: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

/// Address other hosts can reach us on: the local side of a route toward the
/// broadcast address. Falls back to loopback when there is no route.
pub fn detect_local_host(broadcast: Ipv4Addr, port: u16) -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let sock = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.set_broadcast(true)?;
        sock.connect((broadcast, port))?;
        Ok(sock.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "no route for host detection, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Parse one datagram. Anything that is not a well-formed beacon is skipped.
pub fn parse_datagram(buf: &[u8], from: SocketAddr) -> Option<Beacon> {
    match Beacon::decode(buf) {
        Ok(b) => Some(b),
        Err(BeaconError::Length(n)) => {
            trace!(%from, len = n, "ignoring datagram of wrong size");
            None
        }
        Err(e) => {
            trace!(%from, error = %e, "ignoring foreign datagram");
            None
        }
    }
}

/// Receive buffer large enough to notice oversized datagrams.
pub const RECV_BUF_SIZE: usize = BEACON_SIZE * 4;

#[cfg(test)]
mod tests {
    use super::*;
    use zre_core::NodeId;

    #[test]
    fn parses_only_beacons() {
        let from: SocketAddr = "10.0.0.4:5670".parse().unwrap();
        let beacon = Beacon::new(NodeId::generate(), 50000);
        assert_eq!(parse_datagram(&beacon.encode(), from), Some(beacon));
        assert_eq!(parse_datagram(b"hello", from), None);
        let mut bad = beacon.encode();
        bad[0] = b'X';
        assert_eq!(parse_datagram(&bad, from), None);
    }

    #[tokio::test]
    async fn two_sockets_share_the_port() {
        let a = bind_discovery(0).unwrap();
        let port = a.local_addr().unwrap().port();
        let b = bind_discovery(port);
        assert!(b.is_ok());
    }

    #[test]
    fn host_detection_never_returns_unspecified() {
        let ip = detect_local_host(Ipv4Addr::LOCALHOST, 5670);
        assert!(!ip.is_unspecified());
    }
}
