use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use tether::{
    Config, ConnectionHandle, DisconnectReason, Peer, PeerEvent, Reliability, UdpPacketSocket,
};

fn loopback_server() -> (Peer<UdpPacketSocket>, SocketAddr) {
    let server = Peer::bind("127.0.0.1:0", Config::default()).unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn loopback_client() -> Peer<UdpPacketSocket> {
    Peer::new(
        UdpPacketSocket::bind("127.0.0.1:0").unwrap(),
        Config::default(),
    )
    .unwrap()
}

/// Pumps both peers until `done` accepts the collected events, or fails
/// after `timeout_ms`.
fn pump_until(
    server: &mut Peer<UdpPacketSocket>,
    client: &mut Peer<UdpPacketSocket>,
    timeout_ms: u64,
    mut done: impl FnMut(&[PeerEvent], &[PeerEvent]) -> bool,
    events: &mut (Vec<PeerEvent>, Vec<PeerEvent>),
) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let now = Instant::now();
        server.receive(now);
        client.receive(now);
        server.update(now);
        client.update(now);

        events.0.extend(server.drain_events());
        events.1.extend(client.drain_events());
        if done(&events.0, &events.1) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn connect(
    server: &mut Peer<UdpPacketSocket>,
    client: &mut Peer<UdpPacketSocket>,
    server_addr: SocketAddr,
) -> (ConnectionHandle, ConnectionHandle) {
    let to_server = client.connect(server_addr, Instant::now()).unwrap();
    let mut events = (Vec::new(), Vec::new());

    let connected = pump_until(
        server,
        client,
        1000,
        |s, c| {
            s.iter().any(|e| matches!(e, PeerEvent::Connected(_)))
                && c.iter().any(|e| matches!(e, PeerEvent::Connected(_)))
        },
        &mut events,
    );
    assert!(connected, "handshake did not complete: {:?}", events);

    let to_client = events
        .0
        .iter()
        .find_map(|e| match e {
            PeerEvent::Connected(h) => Some(*h),
            _ => None,
        })
        .unwrap();
    (to_server, to_client)
}

#[test]
fn test_handshake_over_loopback() {
    let (mut server, server_addr) = loopback_server();
    let mut client = loopback_client();

    let (to_server, to_client) = connect(&mut server, &mut client, server_addr);

    assert_eq!(to_server.addr, server_addr);
    assert_eq!(to_client.addr, client.local_addr().unwrap());
    assert_eq!(server.connected_count(), 1);
}

#[test]
fn test_reliable_round_trip_over_loopback() {
    let (mut server, server_addr) = loopback_server();
    let mut client = loopback_client();
    let (to_server, to_client) = connect(&mut server, &mut client, server_addr);

    for i in 0..20u8 {
        client
            .send(to_server, vec![i; 64], Reliability::Reliable, Instant::now())
            .unwrap();
    }
    server
        .send(to_client, b"hello".to_vec(), Reliability::Unreliable, Instant::now())
        .unwrap();

    let mut events = (Vec::new(), Vec::new());
    let arrived = pump_until(
        &mut server,
        &mut client,
        1000,
        |s, _| {
            s.iter()
                .any(|e| matches!(e, PeerEvent::Message { payload, .. } if payload[0] == 19))
        },
        &mut events,
    );
    assert!(arrived);

    let received: Vec<u8> = events
        .0
        .iter()
        .filter_map(|e| match e {
            PeerEvent::Message { payload, .. } => Some(payload[0]),
            _ => None,
        })
        .collect();
    assert_eq!(received, (0..20u8).collect::<Vec<_>>());
}

#[test]
fn test_disconnect_over_loopback() {
    let (mut server, server_addr) = loopback_server();
    let mut client = loopback_client();
    let (to_server, _) = connect(&mut server, &mut client, server_addr);

    client.disconnect(to_server, Instant::now()).unwrap();

    let mut events = (Vec::new(), Vec::new());
    let disconnected = pump_until(
        &mut server,
        &mut client,
        1000,
        |s, c| {
            s.iter().any(|e| {
                matches!(
                    e,
                    PeerEvent::Disconnected {
                        reason: DisconnectReason::Remote,
                        ..
                    }
                )
            }) && c.iter().any(|e| {
                matches!(
                    e,
                    PeerEvent::Disconnected {
                        reason: DisconnectReason::Local,
                        ..
                    }
                )
            })
        },
        &mut events,
    );
    assert!(disconnected, "unexpected events: {:?}", events);
    assert_eq!(server.connection_count(), 0);
}
