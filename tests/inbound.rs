//! Network-originated traffic: frames read from peers and forwarded to the bus.

mod common;

use std::time::Duration;

use busgate::{
    error::BusError, Gateway, GatewayConfig, OutboundRequest, ReplyMode, Role,
};
use bytes::Bytes;
use common::{eventually, init_tracing, within, MockBus, Peer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

fn passive(framing: &str, mode: ReplyMode) -> GatewayConfig {
    GatewayConfig::new(Role::Passive, "127.0.0.1:0")
        .with_name("TEST-GW")
        .with_framing(framing)
        .with_reply_mode(mode)
        .with_incoming_service("INSVC")
}

#[tokio::test]
async fn net_to_bus_replies_and_closes() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bus = MockBus::replying(|_| Ok(Bytes::from_static(b"world")));
    let gateway = Gateway::builder(passive("llll", ReplyMode::NetToBus), bus)
        .start()
        .await?;
    let addr = gateway.local_addr().expect("passive gateway is bound");

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&[5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']).await?;

    let mut reply = Vec::new();
    within(stream.read_to_end(&mut reply)).await?;
    assert_eq!(reply, [5, 0, 0, 0, b'w', b'o', b'r', b'l', b'd']);

    let calls = gateway.bus().calls();
    assert_eq!(calls.len(), 1);
    let (service, record) = &calls[0];
    assert_eq!(service, "INSVC");
    assert_eq!(record.gateway, "TEST-GW");
    assert_eq!(record.payload, &b"hello"[..]);
    assert_eq!(record.role, Role::Passive);
    assert_eq!(record.local_addr, Some(addr));

    eventually(|| {
        let stats = gateway.stats();
        stats.connections == 0 && stats.inbound_available == 5
    })
    .await;
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn net_to_bus_closes_without_reply_on_bus_failure() -> Result<(), Box<dyn std::error::Error>>
{
    init_tracing();
    let bus = MockBus::replying(|_| {
        Err(BusError::Service {
            service: "INSVC".into(),
            reason: "down".into(),
            payload: None,
        })
    });
    let gateway = Gateway::builder(passive("bb", ReplyMode::NetToBus), bus)
        .start()
        .await?;

    let mut peer = Peer::new("bb", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    peer.send(b"request").await;

    let mut rest = Vec::new();
    within(peer.stream.read_to_end(&mut rest)).await?;
    assert!(rest.is_empty());
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn async_mode_posts_in_order_and_accepts_sends_back() -> Result<(), Box<dyn std::error::Error>>
{
    init_tracing();
    let config = passive("AAAA", ReplyMode::Async).with_sequential_inbound(true);
    let gateway = Gateway::builder(config, MockBus::echo()).start().await?;

    let mut peer = Peer::new("AAAA", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    for n in 0..10 {
        peer.send(format!("msg-{n}").as_bytes()).await;
    }
    eventually(|| gateway.bus().posts().len() == 10).await;

    let posts = gateway.bus().posts();
    let payloads: Vec<_> = posts.iter().map(|(_, record)| record.payload.clone()).collect();
    let expected: Vec<_> = (0..10).map(|n| Bytes::from(format!("msg-{n}"))).collect();
    assert_eq!(payloads, expected);
    assert!(gateway.bus().calls().is_empty());

    let conn = posts[0].1.conn;
    let reply = gateway
        .send(OutboundRequest::to_connection(conn, "pushed"))
        .await?;
    assert_eq!(reply, None);
    assert_eq!(peer.recv().await, &b"pushed"[..]);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn persistent_mode_answers_many_requests_on_one_connection(
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bus = MockBus::replying(|record| {
        let mut reply = b"re:".to_vec();
        reply.extend_from_slice(&record.payload);
        Ok(reply.into())
    });
    let config = passive("BB", ReplyMode::PersistentSingleExchange).with_sequential_inbound(true);
    let gateway = Gateway::builder(config, bus).start().await?;

    let mut peer = Peer::new("BB", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    for n in 0..3 {
        let request = format!("q{n}");
        peer.send(request.as_bytes()).await;
        assert_eq!(peer.recv().await, format!("re:q{n}").into_bytes());
    }
    assert_eq!(gateway.stats().connections, 1);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bus_error_payload_is_written_back() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bus = MockBus::replying(|_| {
        Err(BusError::Service {
            service: "INSVC".into(),
            reason: "rejected".into(),
            payload: Some(Bytes::from_static(b"ERR")),
        })
    });
    let gateway = Gateway::builder(passive("llll", ReplyMode::PersistentSingleExchange), bus)
        .start()
        .await?;

    let mut peer = Peer::new("llll", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    peer.send(b"bad").await;
    assert_eq!(peer.recv().await, &b"ERR"[..]);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = passive("aaaa", ReplyMode::Async).with_max_message_len(100);
    let gateway = Gateway::builder(config, MockBus::echo()).start().await?;
    let addr = gateway.local_addr().unwrap();

    let mut good = Peer::new("aaaa", TcpStream::connect(addr).await?);
    let mut bad = TcpStream::connect(addr).await?;
    eventually(|| gateway.stats().connections == 2).await;

    bad.write_all(b"00x1").await?;
    let mut rest = Vec::new();
    within(bad.read_to_end(&mut rest)).await?;
    eventually(|| gateway.stats().connections == 1).await;

    good.send(b"still here").await;
    eventually(|| gateway.bus().posts().len() == 1).await;
    assert_eq!(gateway.bus().posts()[0].1.payload, &b"still here"[..]);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_bus_does_not_block_other_connections() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bus = MockBus::echo().with_delay(Duration::from_millis(200));
    let config = passive("llll", ReplyMode::PersistentSingleExchange).with_workers(2, 1);
    let gateway = Gateway::builder(config, bus).start().await?;
    let addr = gateway.local_addr().unwrap();

    let mut a = Peer::new("llll", TcpStream::connect(addr).await?);
    let mut b = Peer::new("llll", TcpStream::connect(addr).await?);
    a.send(b"a").await;
    b.send(b"b").await;

    let (ra, rb) = tokio::join!(a.recv(), b.recv());
    assert_eq!(ra, &b"a"[..]);
    assert_eq!(rb, &b"b"[..]);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn net_to_bus_serves_only_the_first_request() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bus = MockBus::echo().with_delay(Duration::from_millis(100));
    let gateway = Gateway::builder(passive("llll", ReplyMode::NetToBus), bus)
        .start()
        .await?;

    let mut peer = Peer::new("llll", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    peer.send(b"first").await;
    peer.send(b"second").await;
    assert_eq!(peer.recv().await, &b"first"[..]);

    let mut rest = Vec::new();
    within(peer.stream.read_to_end(&mut rest)).await?;
    assert!(rest.is_empty());
    let calls = gateway.bus().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.payload, &b"first"[..]);
    gateway.shutdown().await;
    Ok(())
}
