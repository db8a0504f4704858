//! Data transport: TCP listener (inbound streams) and per-peer outbound links.
//!
//! Every stream starts with the connecting side's greeting; after that each
//! direction carries multi-frame messages. Inbound messages are tagged with
//! the greeting identity and handed to the reactor.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::ops::RangeInclusive;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use zre_core::wire::{self, GREETING_SIZE};
use zre_core::{Frame, FrameDecodeError, FrameEncodeError, MessageAssembler, NodeId};

/// Ports tried when no data port is configured.
pub const DYNAMIC_PORTS: RangeInclusive<u16> = 0xC000..=0xFFFF;
const BIND_ATTEMPTS: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// One complete message read from a peer's stream.
#[derive(Debug)]
pub struct Inbound {
    pub peer: NodeId,
    pub frames: Vec<Frame>,
}

/// A link's writer gave up; `link` tells stale notices apart from the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFailure {
    pub peer: NodeId,
    pub link: u64,
}

/// Bind the data listener. Port 0 picks a random port in [`DYNAMIC_PORTS`].
pub fn bind_listener(host: IpAddr, port: u16) -> io::Result<TcpListener> {
    if port != 0 {
        return listen(SocketAddr::new(host, port));
    }
    let mut rng = rand::thread_rng();
    let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no free dynamic port");
    for _ in 0..BIND_ATTEMPTS {
        let candidate = rng.gen_range(DYNAMIC_PORTS);
        match listen(SocketAddr::new(host, candidate)) {
            Ok(l) => return Ok(l),
            Err(e) => {
                trace!(port = candidate, error = %e, "dynamic port taken");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let std_listener = StdTcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Read one inbound stream until it closes, forwarding each complete message.
pub async fn read_stream(
    mut stream: TcpStream,
    inbound: mpsc::Sender<Inbound>,
) -> Result<(), StreamError> {
    let mut greeting = [0u8; GREETING_SIZE];
    stream.read_exact(&mut greeting).await?;
    let peer = wire::decode_greeting(&greeting)?;
    debug!(peer = %peer, "inbound stream open");

    let mut assembler = MessageAssembler::default();
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            debug!(peer = %peer, "inbound stream closed");
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);
        let (messages, used) = assembler.feed(&pending)?;
        pending.drain(..used);
        for frames in messages {
            if inbound.send(Inbound { peer, frames }).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Outbound side of one peer: a bounded queue drained by a writer task.
/// Dropping the link closes the stream.
pub struct PeerLink {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    /// Spawn the writer: connect to `endpoint`, greet with `me`, then drain
    /// the queue. Any I/O error is reported once on `failed`.
    pub fn open(
        id: u64,
        me: NodeId,
        peer: NodeId,
        endpoint: &str,
        hwm: usize,
        failed: mpsc::UnboundedSender<LinkFailure>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(hwm.max(1));
        let endpoint = endpoint
            .strip_prefix("tcp://")
            .unwrap_or(endpoint)
            .to_string();
        let writer = tokio::spawn(async move {
            let result: io::Result<()> = async {
                let mut stream = TcpStream::connect(endpoint.as_str()).await?;
                stream.set_nodelay(true)?;
                stream.write_all(&wire::encode_greeting(&me)).await?;
                while let Some(bytes) = rx.recv().await {
                    stream.write_all(&bytes).await?;
                }
                stream.shutdown().await
            }
            .await;
            if let Err(e) = result {
                debug!(peer = %peer, endpoint = %endpoint, error = %e, "outbound link failed");
                let _ = failed.send(LinkFailure { peer, link: id });
            }
        });
        Self { id, tx, writer }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one message without waiting.
    pub fn send(&self, frames: &[Frame]) -> Result<(), LinkError> {
        let bytes = wire::encode_message(frames)?;
        self.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("outbound queue full")]
    Full,
    #[error("link closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn dynamic_port_in_range() {
        let l = bind_listener(LOCALHOST, 0).unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(DYNAMIC_PORTS.contains(&port));
    }

    #[tokio::test]
    async fn link_delivers_messages_tagged_with_greeting() {
        let listener = bind_listener(LOCALHOST, 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let (in_tx, mut in_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = read_stream(stream, in_tx).await;
        });

        let me = NodeId::generate();
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let link = PeerLink::open(1, me, NodeId::generate(), &addr.to_string(), 10, fail_tx);
        link.send(&[b"one".to_vec()]).unwrap();
        link.send(&[b"two".to_vec(), b"body".to_vec()]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), in_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.peer, me);
        assert_eq!(first.frames, vec![b"one".to_vec()]);
        let second = in_rx.recv().await.unwrap();
        assert_eq!(second.frames, vec![b"two".to_vec(), b"body".to_vec()]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = bind_listener(LOCALHOST, 0)
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let peer = NodeId::generate();
        let _link = PeerLink::open(7, NodeId::generate(), peer, &format!("tcp://127.0.0.1:{port}"), 10, fail_tx);
        let failure = tokio::time::timeout(Duration::from_secs(5), fail_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure, LinkFailure { peer, link: 7 });
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        // Single-threaded test runtime: the writer cannot drain before we yield.
        let link = PeerLink::open(1, NodeId::generate(), NodeId::generate(), "10.255.255.1:9", 1, fail_tx);
        link.send(&[b"a".to_vec()]).unwrap();
        assert!(matches!(link.send(&[b"b".to_vec()]), Err(LinkError::Full)));
    }
}
