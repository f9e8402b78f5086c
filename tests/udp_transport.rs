#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the datagram transport: handshake, demultiplexing,
//! tick scheduling, and teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use network_transport::{Channel, ChannelState, Service, TransportError, UdpService};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const TICK: Duration = Duration::from_millis(10);

/// Drive update passes on every service until `done` holds.
async fn drive<F: Fn() -> bool>(services: &[&UdpService], done: F) {
    timeout(Duration::from_secs(5), async {
        loop {
            for service in services {
                service.update();
            }
            if done() {
                return;
            }
            sleep(TICK).await;
        }
    })
    .await
    .expect("condition not reached within timeout");
}

async fn pair() -> (Arc<UdpService>, Arc<UdpService>, SocketAddr) {
    let server = Arc::new(
        UdpService::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let client = Arc::new(UdpService::client().await.unwrap());
    (server, client, addr)
}

// ============================================================================
// HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_connect_and_accept_yield_connected_pair() {
    let (server, client, addr) = pair().await;
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };

    let channel = client.connect_channel(addr).unwrap();
    // No await point has run since connect: the ACK cannot have been
    // processed yet, so the channel must still be handshaking.
    assert_eq!(channel.state(), ChannelState::Handshaking);

    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;

    let accepted = accept.await.unwrap().unwrap();
    assert_eq!(accepted.state(), ChannelState::Connected);
    assert_eq!(server.channel_count(), 1);
    assert_eq!(client.channel_count(), 1);
    assert_eq!(accepted.remote_addr().unwrap().ip(), addr.ip());
}

#[tokio::test]
async fn test_duplicate_syn_reacks_without_duplicate_channel() {
    let server = Arc::new(
        UdpService::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    sleep(Duration::from_millis(20)).await; // let the waiter arm

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut syn = Vec::new();
    syn.extend(1u32.to_le_bytes());
    syn.extend(4242u32.to_le_bytes());
    probe.send_to(&syn, addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(5), probe.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf[0..4], &2u32.to_le_bytes());
    assert_eq!(&buf[4..8], &4242u32.to_le_bytes());
    let first_response: [u8; 4] = buf[8..12].try_into().unwrap();

    let accepted = accept.await.unwrap().unwrap();
    assert_eq!(u32::from_le_bytes(first_response), accepted.id());
    assert_eq!(server.channel_count(), 1);

    // Retransmit: the ACK is re-sent idempotently, no second channel.
    probe.send_to(&syn, addr).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(5), probe.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 12);
    assert_eq!(buf[8..12], first_response);
    assert_eq!(server.channel_count(), 1);
}

#[tokio::test]
async fn test_syn_without_pending_accept_is_dropped() {
    let server = Arc::new(
        UdpService::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut syn = Vec::new();
    syn.extend(1u32.to_le_bytes());
    syn.extend(7777u32.to_le_bytes());
    probe.send_to(&syn, addr).await.unwrap();

    let mut buf = [0u8; 64];
    let answered = timeout(Duration::from_millis(200), probe.recv_from(&mut buf)).await;
    assert!(answered.is_err(), "unsolicited syn must not be answered");
    assert_eq!(server.channel_count(), 0);
}

#[tokio::test]
async fn test_second_accept_replaces_the_waiter() {
    let (server, client, addr) = pair().await;
    let first = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    sleep(Duration::from_millis(20)).await;
    let second = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    sleep(Duration::from_millis(20)).await;

    let replaced = first.await.unwrap();
    assert!(matches!(replaced, Err(TransportError::AcceptCanceled)));

    // The fresh waiter still works.
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    let accepted = second.await.unwrap().unwrap();
    assert_eq!(accepted.state(), ChannelState::Connected);
}

// ============================================================================
// DEMULTIPLEXING
// ============================================================================

#[tokio::test]
async fn test_unknown_and_malformed_packets_are_dropped_silently() {
    let server = Arc::new(
        UdpService::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Data for an id that was never registered.
    let mut unknown = Vec::new();
    unknown.extend(999_999u32.to_le_bytes());
    unknown.extend([0xDE, 0xAD]);
    probe.send_to(&unknown, addr).await.unwrap();

    // Control packets with the wrong length for their opcode.
    probe.send_to(&1u32.to_le_bytes(), addr).await.unwrap();
    let mut long_ack = Vec::new();
    long_ack.extend(2u32.to_le_bytes());
    long_ack.extend([0u8; 16]);
    probe.send_to(&long_ack, addr).await.unwrap();

    // Too short to carry a discriminant at all.
    probe.send_to(&[1, 2], addr).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    server.update();
    assert_eq!(server.channel_count(), 0);

    // The service is still healthy: a real handshake goes through.
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    let client = Arc::new(UdpService::client().await.unwrap());
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    accept.await.unwrap().unwrap();
}

// ============================================================================
// DATA FLOW AND TICK SCHEDULING
// ============================================================================

#[tokio::test]
async fn test_payload_delivered_with_current_tick() {
    let (server, client, addr) = pair().await;
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    let accepted = accept.await.unwrap().unwrap();

    let received: Arc<Mutex<Vec<(Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        accepted.set_recv_handler(Box::new(move |bytes, tick| {
            received.lock().unwrap().push((bytes.to_vec(), tick));
        }));
    }

    channel.send(&[0xAA, 0xBB, 0xCC]).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        !received.lock().unwrap().is_empty()
    })
    .await;

    let got = received.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, vec![0xAA, 0xBB, 0xCC]);
    assert!(got[0].1 > 0);
    assert!(got[0].1 <= server.time_now());
}

#[tokio::test]
async fn test_dirty_and_removed_same_tick_flushes_before_purge() {
    let (server, client, addr) = pair().await;
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    let accepted = accept.await.unwrap().unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        channel.set_recv_handler(Box::new(move |bytes, _tick| {
            received.lock().unwrap().push(bytes.to_vec());
        }));
    }

    // Queue outbound bytes (marks the channel dirty) and remove it in the
    // same tick: the update pass must still flush before purging.
    accepted.send(&[0x42, 0x43]).unwrap();
    server.remove(accepted.id());
    assert_eq!(server.channel_count(), 1, "purge is deferred to end of tick");
    server.update();
    assert_eq!(server.channel_count(), 0, "purged at end of the same tick");

    drive(&[client.as_ref()], || !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0], vec![0x42, 0x43]);
}

#[tokio::test]
async fn test_remove_is_idempotent_and_ignores_unknown_ids() {
    let (server, _client, _addr) = pair().await;
    server.remove(123_456);
    server.update();
    assert_eq!(server.channel_count(), 0);
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_fin_disposes_the_remote_channel() {
    let (server, client, addr) = pair().await;
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    let accepted = accept.await.unwrap().unwrap();

    let errored = Arc::new(AtomicBool::new(false));
    {
        let errored = Arc::clone(&errored);
        accepted.set_error_handler(Box::new(move |_, _| {
            errored.store(true, Ordering::SeqCst);
        }));
    }

    // Client-side dispose is immediate locally and sends a best-effort FIN.
    channel.dispose();
    assert_eq!(client.channel_count(), 0);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.send(&[1]).is_err());

    drive(&[server.as_ref(), client.as_ref()], || {
        errored.load(Ordering::SeqCst)
    })
    .await;
    assert_eq!(server.channel_count(), 0);
}

#[tokio::test]
async fn test_dispose_cascades_to_channels_and_cancels_accept() {
    let (server, client, addr) = pair().await;
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    let channel = client.connect_channel(addr).unwrap();
    drive(&[server.as_ref(), client.as_ref()], || {
        channel.state() == ChannelState::Connected
    })
    .await;
    accept.await.unwrap().unwrap();

    let pending = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_channel().await })
    };
    sleep(Duration::from_millis(20)).await;

    server.dispose();
    assert_eq!(server.channel_count(), 0);
    let canceled = pending.await.unwrap();
    assert!(matches!(canceled, Err(TransportError::AcceptCanceled)));
    assert!(matches!(
        server.connect_channel(addr),
        Err(TransportError::ServiceDisposed)
    ));
}

#[tokio::test]
async fn test_bind_failure_names_the_address() {
    let first = UdpService::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let busy = first.local_addr().unwrap();
    let err = UdpService::bind(busy).await.expect_err("port is taken");
    match &err {
        TransportError::Bind { addr, .. } => assert_eq!(*addr, busy),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains(&busy.to_string()));
}
