#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end sessions over an in-memory duplex transport.

use bedrock_wire::codec::{ExtensionRegistry, Value};
use bedrock_wire::config::{IV_LEN, KEY_LEN};
use bedrock_wire::core::frame::SecretMaterial;
use bedrock_wire::error::ProtocolError;
use bedrock_wire::protocol::Protocol;
use bedrock_wire::{SecureConnection, WireConfig};
use bytes::Bytes;
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const FIXTURE: &str = include_str!("fixtures/protocol.json");

type Transport = Framed<DuplexStream, LengthDelimitedCodec>;

fn protocol() -> Arc<Protocol> {
    Arc::new(Protocol::from_json(FIXTURE, &ExtensionRegistry::default()).unwrap())
}

fn secret() -> SecretMaterial {
    SecretMaterial::new([0x5a; KEY_LEN], [0xa5; IV_LEN])
}

fn transports() -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (
        Framed::new(a, LengthDelimitedCodec::new()),
        Framed::new(b, LengthDelimitedCodec::new()),
    )
}

fn pair(config: &WireConfig) -> (SecureConnection<Transport>, SecureConnection<Transport>) {
    let (a, b) = transports();
    let protocol = protocol();
    (
        SecureConnection::new(a, protocol.clone(), secret(), config).unwrap(),
        SecureConnection::new(b, protocol, secret(), config).unwrap(),
    )
}

fn set_time(time: i64) -> Value {
    Value::map([("time", Value::Int(time))])
}

#[tokio::test]
async fn test_send_and_receive() {
    let (mut client, mut server) = pair(&WireConfig::default());

    client.send("set_time", &set_time(6000)).await.unwrap();
    let packet = server.recv().await.unwrap();
    assert_eq!(packet.name, "set_time");
    assert_eq!(packet.params, set_time(6000));

    let bye = Value::map([
        ("hide_disconnect_reason", Value::Bool(false)),
        ("message", Value::from("server closed")),
    ]);
    server.send("disconnect", &bye).await.unwrap();
    let packet = client.recv().await.unwrap();
    assert_eq!(packet.name, "disconnect");
    assert_eq!(packet.params, bye);

    assert_eq!(client.send_counter(), 1);
    assert_eq!(client.recv_counter(), 1);
    assert_eq!(server.send_counter(), 1);
    assert_eq!(server.recv_counter(), 1);
}

#[tokio::test]
async fn test_many_packets_keep_order() {
    let (mut client, mut server) = pair(&WireConfig::default());
    for t in 0..50 {
        client.send("set_time", &set_time(t)).await.unwrap();
    }
    for t in 0..50 {
        assert_eq!(server.recv().await.unwrap().params, set_time(t));
    }
    assert_eq!(server.recv_counter(), 50);
}

#[tokio::test]
async fn test_batched_flush_is_one_frame() {
    let config = WireConfig::default_with_overrides(|c| c.session.batching = true);
    let (mut client, mut server) = pair(&config);

    for t in [1, 2, 3] {
        client.queue("set_time", &set_time(t)).unwrap();
    }
    assert_eq!(client.send_counter(), 0);
    client.flush().await.unwrap();
    assert_eq!(client.send_counter(), 1);

    for t in [1, 2, 3] {
        assert_eq!(server.recv().await.unwrap().params, set_time(t));
    }
    assert_eq!(server.recv_counter(), 1);
}

#[tokio::test]
async fn test_flush_with_nothing_queued() {
    let (mut client, _server) = pair(&WireConfig::default());
    client.flush().await.unwrap();
    assert_eq!(client.send_counter(), 0);
}

#[tokio::test]
async fn test_encode_failure_sends_nothing() {
    let (mut client, _server) = pair(&WireConfig::default());
    let err = client.send("not_a_packet", &Value::Void).await.unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownPacketName(_)));
    assert_eq!(client.send_counter(), 0);
}

#[tokio::test]
async fn test_oversized_packet_is_refused() {
    let mut config = WireConfig::default();
    config.frame.max_decompressed_size = 1024;
    let (mut client, _server) = pair(&config);
    let params = Value::map([
        ("channel", Value::from("bulk")),
        ("data", Value::Bytes(vec![7; 4096])),
    ]);
    assert!(matches!(
        client.send("script_message", &params).await,
        Err(ProtocolError::OversizedPacket(_))
    ));
    assert_eq!(client.send_counter(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_halves_run_concurrently() {
    let (client, server) = pair(&WireConfig::default());
    let (mut client_tx, mut client_rx) = client.into_split();
    let (mut server_tx, mut server_rx) = server.into_split();

    let echo = tokio::spawn(async move {
        for _ in 0..20 {
            let packet = server_rx.recv().await.unwrap();
            server_tx.send(&packet.name, &packet.params).await.unwrap();
        }
        (server_rx.counter(), server_tx.counter())
    });
    let writer = tokio::spawn(async move {
        for t in 0..20 {
            client_tx.send("set_time", &set_time(t * 10)).await.unwrap();
        }
        client_tx.counter()
    });

    for t in 0..20 {
        assert_eq!(client_rx.recv().await.unwrap().params, set_time(t * 10));
    }
    assert_eq!(writer.await.unwrap(), 20);
    assert_eq!(echo.await.unwrap(), (20, 20));
    assert_eq!(client_rx.counter(), 20);
}

#[tokio::test]
async fn test_large_payload_is_offloaded() {
    let mut config = WireConfig::default();
    config.session.offload_threshold_bytes = 16;
    let (mut client, mut server) = pair(&config);

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let params = Value::map([
        ("channel", Value::from("bulk")),
        ("data", Value::Bytes(data)),
    ]);
    client.send("script_message", &params).await.unwrap();
    let packet = server.recv().await.unwrap();
    assert_eq!(packet.name, "script_message");
    assert_eq!(packet.params, params);
}

#[tokio::test]
async fn test_tampered_frame_fails_closed() {
    let (mut raw, peer) = transports();
    let mut server = SecureConnection::new(peer, protocol(), secret(), &WireConfig::default()).unwrap();

    raw.send(Bytes::from_static(&[0x13; 24])).await.unwrap();
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::IntegrityViolation { counter: 0 }));
    assert!(err.is_fatal());

    // Nothing is accepted afterwards.
    raw.send(Bytes::from_static(&[0x00; 24])).await.unwrap();
    assert!(matches!(
        server.recv().await,
        Err(ProtocolError::SecurityError(_))
    ));
    assert_eq!(server.recv_counter(), 0);
}

#[tokio::test]
async fn test_wrong_key_is_integrity_violation() {
    let (a, b) = transports();
    let protocol = protocol();
    let mut client = SecureConnection::new(
        a,
        protocol.clone(),
        SecretMaterial::new([1; KEY_LEN], [0; IV_LEN]),
        &WireConfig::default(),
    )
    .unwrap();
    let mut server = SecureConnection::new(b, protocol, secret(), &WireConfig::default()).unwrap();

    client.send("set_time", &set_time(1)).await.unwrap();
    assert!(matches!(
        server.recv().await,
        Err(ProtocolError::IntegrityViolation { counter: 0 })
    ));
}

#[tokio::test]
async fn test_recv_timeout() {
    let (_client, server) = pair(&WireConfig::default());
    let mut server = server.with_timeouts(Duration::from_secs(1), Duration::from_millis(20));
    assert!(matches!(server.recv().await, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_peer_drop_is_connection_closed() {
    let (client, mut server) = pair(&WireConfig::default());
    drop(client);
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_activity_clock_resets() {
    let (mut client, mut server) = pair(&WireConfig::default());
    tokio::time::sleep(Duration::from_millis(30)).await;
    let idle = client.time_since_last_activity();
    assert!(idle >= Duration::from_millis(30));
    client.send("set_time", &set_time(0)).await.unwrap();
    assert!(client.time_since_last_activity() < idle);
    server.recv().await.unwrap();
    assert_eq!(server.protocol().version(), 431);
}

#[tokio::test]
async fn test_failed_flush_discards_remaining_frames() {
    // Nobody reads the far end, so the first large frame stalls the transport.
    let (a, _b) = tokio::io::duplex(64);
    let transport = Framed::new(a, LengthDelimitedCodec::new());
    let mut client = SecureConnection::new(transport, protocol(), secret(), &WireConfig::default())
        .unwrap()
        .with_timeouts(Duration::from_millis(20), Duration::from_secs(1));

    let mut seed = 0x2545_f491u32;
    let noise: Vec<u8> = (0..4096)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as u8
        })
        .collect();
    let params = Value::map([
        ("channel", Value::from("bulk")),
        ("data", Value::Bytes(noise)),
    ]);
    assert!(matches!(
        client.send("script_message", &params).await,
        Err(ProtocolError::Timeout)
    ));

    for t in [1, 2, 3] {
        client.queue("set_time", &set_time(t)).unwrap();
    }
    assert!(matches!(
        client.flush().await,
        Err(ProtocolError::SecurityError(_))
    ));
    // The rest of the queue went with the failed frame.
    client.flush().await.unwrap();
    assert_eq!(client.send_counter(), 1);
}
