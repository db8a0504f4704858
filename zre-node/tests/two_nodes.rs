//! Two nodes on loopback, introduced by a unicast beacon.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use zre_core::Beacon;
use zre_node::{Event, Node, NodeConfig, NodeError, NodeId};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(10);

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(name: &str) -> NodeConfig {
    NodeConfig {
        name: Some(name.to_string()),
        discovery_port: free_udp_port(),
        bind_host: LOCALHOST,
        advertised_host: Some(LOCALHOST),
        beacons_enabled: false,
        interval_ms: 100,
        evasive_ms: 500,
        expired_ms: 1500,
        ..NodeConfig::default()
    }
}

async fn wait_for(node: &mut Node, mut pred: impl FnMut(&Event) -> bool) -> Event {
    timeout(WAIT, async {
        loop {
            match node.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("node stopped while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_enter_of(id: NodeId) -> impl FnMut(&Event) -> bool {
    move |e| matches!(e, Event::Enter { peer, .. } if *peer == id)
}

/// Start two nodes and wait until each has seen the other enter.
async fn connected_pair() -> (Node, Node) {
    let mut a_cfg = config("alpha");
    a_cfg.headers.insert("X-ROLE".into(), "sensor".into());
    let b_cfg = config("bravo");
    let b_discovery = SocketAddr::new(LOCALHOST, b_cfg.discovery_port);

    let mut a = Node::new(a_cfg).await.unwrap();
    let mut b = Node::new(b_cfg).await.unwrap();
    a.start().unwrap();
    b.start().unwrap();
    a.connect(b_discovery).await.unwrap();

    let (a_id, b_id) = (a.identity(), b.identity());
    wait_for(&mut a, is_enter_of(b_id)).await;
    wait_for(&mut b, is_enter_of(a_id)).await;
    (a, b)
}

#[tokio::test]
async fn enter_carries_name_endpoint_and_headers() {
    let mut a_cfg = config("alpha");
    a_cfg.headers.insert("X-ROLE".into(), "sensor".into());
    let b_cfg = config("bravo");
    let b_discovery = SocketAddr::new(LOCALHOST, b_cfg.discovery_port);
    let a = Node::new(a_cfg).await.unwrap();
    let mut b = Node::new(b_cfg).await.unwrap();
    a.start().unwrap();
    b.start().unwrap();
    a.connect(b_discovery).await.unwrap();

    let event = wait_for(&mut b, is_enter_of(a.identity())).await;
    let Event::Enter {
        name,
        endpoint,
        headers,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(name, "alpha");
    assert_eq!(endpoint, a.endpoint().await.unwrap());
    assert_eq!(headers.get("X-ROLE").map(String::as_str), Some("sensor"));
}

#[tokio::test]
async fn whisper_is_delivered() {
    let (a, mut b) = connected_pair().await;
    a.whisper(b.identity(), b"hi there".to_vec()).unwrap();
    let a_id = a.identity();
    let event = wait_for(&mut b, |e| matches!(e, Event::Whisper { .. })).await;
    assert_eq!(
        event,
        Event::Whisper {
            peer: a_id,
            name: "alpha".into(),
            content: b"hi there".to_vec()
        }
    );
}

#[tokio::test]
async fn join_then_shout_reaches_group_member() {
    let (mut a, mut b) = connected_pair().await;
    let b_id = b.identity();
    b.join("home").unwrap();
    wait_for(&mut a, |e| {
        matches!(e, Event::Join { peer, group, .. } if *peer == b_id && group == "home")
    })
    .await;
    assert_eq!(a.peers_by_group("home").await.unwrap(), Some(vec![b_id]));
    assert_eq!(b.own_groups().await.unwrap(), vec!["home".to_string()]);

    a.shout("home", &b"dinner"[..]).unwrap();
    let event = wait_for(&mut b, |e| matches!(e, Event::Shout { .. })).await;
    assert!(matches!(
        event,
        Event::Shout { group, content, .. } if group == "home" && content == b"dinner"
    ));

    // Shouting to a group nobody joined is silently dropped.
    a.shout("nowhere", &b"x"[..]).unwrap();
}

#[tokio::test]
async fn peer_queries_reflect_handshake() {
    let (a, b) = connected_pair().await;
    assert_eq!(b.peers().await.unwrap(), vec![a.identity()]);
    let info = b.peer(a.identity()).await.unwrap().unwrap();
    assert_eq!(info.name, "alpha");
    assert_eq!(
        b.peer_header(a.identity(), "X-ROLE").await.unwrap().as_deref(),
        Some("sensor")
    );
    assert_eq!(b.peer_header(a.identity(), "missing").await.unwrap(), None);
    assert!(b.peer(NodeId::generate()).await.unwrap().is_none());
}

#[tokio::test]
async fn stopped_peer_expires() {
    let (mut a, mut b) = connected_pair().await;
    let b_id = b.identity();
    b.stop().await.unwrap();
    wait_for(&mut a, |e| matches!(e, Event::Exit { peer, .. } if *peer == b_id)).await;
    assert!(a.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn commands_after_stop_are_rejected() {
    let mut node = Node::new(config("solo")).await.unwrap();
    node.stop().await.unwrap();
    assert!(matches!(node.join("g"), Err(NodeError::Stopped)));
    assert!(matches!(node.peers().await, Err(NodeError::Stopped)));
}

#[tokio::test]
async fn binding_a_taken_data_port_fails() {
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let mut cfg = config("clash");
    cfg.port = taken.local_addr().unwrap().port();
    assert!(matches!(
        Node::new(cfg).await,
        Err(NodeError::Bind { .. })
    ));
}

#[tokio::test]
async fn connect_right_after_start_sends_a_beacon() {
    let listener = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let node = Node::new(config("eager")).await.unwrap();
    node.start().unwrap();
    node.connect(listener.local_addr().unwrap()).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(WAIT, listener.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let beacon = Beacon::decode(&buf[..n]).unwrap();
    assert_eq!(beacon.node_id, node.identity());
    let endpoint = node.endpoint().await.unwrap();
    assert!(endpoint.ends_with(&format!(":{}", beacon.port)));
}

#[tokio::test]
async fn rebound_node_is_still_reachable() {
    let a_cfg = config("alpha");
    let old_discovery = a_cfg.discovery_port;
    let mut a = Node::new(a_cfg).await.unwrap();
    let mut b = Node::new(config("bravo")).await.unwrap();
    let old_endpoint = a.endpoint().await.unwrap();

    let data_port = free_tcp_port();
    let new_endpoint = a
        .set_endpoint(SocketAddr::new(LOCALHOST, data_port))
        .await
        .unwrap();
    assert_eq!(new_endpoint, format!("127.0.0.1:{data_port}"));
    assert_ne!(new_endpoint, old_endpoint);

    let mut discovery_port = free_udp_port();
    while discovery_port == old_discovery {
        discovery_port = free_udp_port();
    }
    a.set_discovery_port(discovery_port).await.unwrap();
    a.set_interval(Duration::from_millis(50)).unwrap();

    a.start().unwrap();
    b.start().unwrap();
    b.connect(SocketAddr::new(LOCALHOST, discovery_port)).await.unwrap();

    let a_id = a.identity();
    let event = wait_for(&mut b, is_enter_of(a_id)).await;
    assert!(matches!(event, Event::Enter { endpoint, .. } if endpoint == new_endpoint));
    wait_for(&mut a, is_enter_of(b.identity())).await;
}
