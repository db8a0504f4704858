//! Publishes LOG records as UDP datagrams to a collector.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};

use tokio::net::UdpSocket;
use tracing::trace;
use zre_core::{codec, LogMessage};

pub struct LogSink {
    socket: UdpSocket,
    collector: SocketAddr,
}

impl LogSink {
    pub fn bind(collector: SocketAddr) -> io::Result<Self> {
        let local = match collector.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let std_sock = StdUdpSocket::bind(SocketAddr::new(local, 0))?;
        std_sock.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(std_sock)?,
            collector,
        })
    }

    /// Best effort: records that cannot be encoded or sent are dropped.
    pub async fn publish(&self, record: &LogMessage) {
        let frame = match codec::encode_log(record) {
            Ok(f) => f,
            Err(e) => {
                trace!(error = %e, "log record not encodable");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, self.collector).await {
            trace!(collector = %self.collector, error = %e, "log record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use zre_core::protocol::{LogEvent, LogLevel};

    #[tokio::test]
    async fn collector_receives_decodable_record() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = LogSink::bind(collector.local_addr().unwrap()).unwrap();
        let record = LogMessage {
            level: LogLevel::Info,
            event: LogEvent::Join,
            node: 0x1234,
            peer: 0,
            time: 1_700_000_000_000,
            data: "home".into(),
        };
        sink.publish(&record).await;
        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), collector.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codec::decode_log(&buf[..n]).unwrap(), record);
    }
}
