//! Connection lifecycle: capacity, status notifications, timers and shutdown.

mod common;

use std::time::Duration;

use busgate::{
    bus::ConnectionEvent, error::GatewayError, Gateway, GatewayConfig, OutboundRequest, ReplyMode,
    Role,
};
use common::{eventually, init_tracing, within, MockBus, Peer, Statuses};
use tokio::{io::AsyncReadExt, net::TcpStream};

fn passive() -> GatewayConfig {
    GatewayConfig::new(Role::Passive, "127.0.0.1:0")
        .with_name("LIFE")
        .with_framing("llll")
        .with_reply_mode(ReplyMode::Async)
}

#[tokio::test]
async fn connections_beyond_capacity_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let gateway = Gateway::builder(passive().with_max_connections(1), MockBus::echo())
        .start()
        .await?;
    let addr = gateway.local_addr().unwrap();

    let _first = TcpStream::connect(addr).await?;
    eventually(|| gateway.stats().connections == 1).await;

    let mut second = TcpStream::connect(addr).await?;
    let mut buf = Vec::new();
    within(second.read_to_end(&mut buf)).await?;
    assert!(buf.is_empty());
    assert_eq!(gateway.stats().connections, 1);
    assert_eq!(gateway.stats().free_slots, 0);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn status_is_reported_on_open_and_close() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let statuses = Statuses::default();
    let gateway = Gateway::builder(passive(), MockBus::echo())
        .with_notifier(statuses.clone())
        .start()
        .await?;
    let addr = gateway.local_addr().unwrap();

    let client = TcpStream::connect(addr).await?;
    let client_addr = client.local_addr()?;
    eventually(|| statuses.snapshot().len() == 1).await;
    drop(client);
    eventually(|| statuses.snapshot().len() == 2).await;

    let events = statuses.snapshot();
    assert_eq!(events[0].event, ConnectionEvent::Established);
    assert_eq!(events[1].event, ConnectionEvent::Closed);
    for status in &events {
        assert_eq!(status.gateway, "LIFE");
        assert_eq!(status.slot, 1);
        assert_eq!(status.role_flag, 'P');
        assert_eq!(status.peer_addr, client_addr);
        assert_eq!(status.local_addr, addr);
    }
    assert_eq!(events[0].conn, events[1].conn);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reconnects_get_fresh_compiled_ids() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let statuses = Statuses::default();
    let gateway = Gateway::builder(passive().with_max_connections(1), MockBus::echo())
        .with_notifier(statuses.clone())
        .start()
        .await?;
    let addr = gateway.local_addr().unwrap();

    drop(TcpStream::connect(addr).await?);
    eventually(|| statuses.snapshot().len() == 2).await;
    let _second = TcpStream::connect(addr).await?;
    eventually(|| statuses.snapshot().len() == 3).await;

    let events = statuses.snapshot();
    assert_eq!(events[0].slot, events[2].slot);
    assert_ne!(events[0].conn, events[2].conn);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idle_connections_are_closed() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = passive().with_idle_timeout(Duration::from_millis(100));
    let gateway = Gateway::builder(config, MockBus::echo()).start().await?;

    let mut client = TcpStream::connect(gateway.local_addr().unwrap()).await?;
    let mut buf = Vec::new();
    within(client.read_to_end(&mut buf)).await?;
    assert!(buf.is_empty());
    eventually(|| gateway.stats().connections == 0).await;
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn keepalives_are_written_and_ignored() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = passive().with_keepalive_period(Duration::from_millis(50));
    let gateway = Gateway::builder(config, MockBus::echo()).start().await?;

    let mut peer = Peer::new("llll", TcpStream::connect(gateway.local_addr().unwrap()).await?);
    assert!(peer.recv().await.is_empty());
    assert!(peer.recv().await.is_empty());

    peer.send(b"").await;
    peer.send(b"data").await;
    eventually(|| gateway.bus().posts().len() == 1).await;
    assert_eq!(gateway.bus().posts()[0].1.payload, &b"data"[..]);
    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_connections_and_refuses_sends() -> Result<(), Box<dyn std::error::Error>>
{
    init_tracing();
    let gateway = Gateway::builder(passive(), MockBus::echo()).start().await?;
    let mut client = TcpStream::connect(gateway.local_addr().unwrap()).await?;
    eventually(|| gateway.stats().connections == 1).await;

    gateway.shutdown().await;
    assert!(gateway.is_shutting_down());

    let mut buf = Vec::new();
    within(client.read_to_end(&mut buf)).await?;
    assert_eq!(gateway.stats().connections, 0);

    let err = gateway.send(OutboundRequest::any("x")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Shutdown));
    Ok(())
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let config = GatewayConfig::new(Role::Passive, "127.0.0.1:0").with_reply_mode(ReplyMode::BusToNet);
    let err = Gateway::builder(config, MockBus::echo())
        .start()
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));

    let config = GatewayConfig::new(Role::Passive, "127.0.0.1:0").with_framing("lb");
    assert!(Gateway::builder(config, MockBus::echo()).start().await.is_err());
}
