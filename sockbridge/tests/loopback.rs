//! End-to-end tests over real loopback sockets.
//!
//! Each test builds its own `Bridge` so event channels never see another
//! test's sockets.

use std::time::Duration;

use bytes::Bytes;
use sockbridge::{Bridge, BridgeError, ServerEvent, SocketConfig, TcpEvent, UdpEvent};

const TIMEOUT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(300);

fn init() -> Bridge {
    sockbridge::dev_tracing::init_tracing();
    Bridge::new()
}

/// Listen on an ephemeral port and return (server id, port).
fn listening_server(bridge: &Bridge) -> (u32, u16) {
    let server = bridge.tcp_server().create(SocketConfig::default());
    bridge
        .tcp_server()
        .listen(server, "127.0.0.1", 0, None)
        .unwrap();
    let port = bridge
        .tcp_server()
        .get_info(server)
        .unwrap()
        .local_port()
        .unwrap();
    (server, port)
}

#[test]
fn ids_unique_and_monotonic_across_families() {
    let bridge = init();
    let mut ids = Vec::new();
    ids.push(bridge.tcp().create(SocketConfig::default()));
    ids.push(bridge.tcp_server().create(SocketConfig::default()));
    ids.push(bridge.udp().create(SocketConfig::default()));
    ids.push(bridge.tcp().create(SocketConfig::default()));

    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len(), "ids must be unique");
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must increase");
}

#[test]
fn connect_accept_and_exchange_data() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let receives = bridge.tcp().register_receive_events().unwrap();

    let (server, port) = listening_server(&bridge);

    let client = bridge.tcp().create(SocketConfig::default());
    let connected = bridge.tcp().connect(client, "127.0.0.1", port).unwrap();
    connected.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert!(bridge.tcp().get_info(client).unwrap().connected);

    let (socket_id, accepted) = match accepts.recv_timeout(TIMEOUT).unwrap() {
        ServerEvent::Accept {
            socket_id,
            client_socket_id,
        } => (socket_id, client_socket_id),
        other => panic!("expected accept, got {other:?}"),
    };
    assert_eq!(socket_id, server);

    // The adopted socket is a live, paused stream-client socket.
    let info = bridge.tcp().get_info(accepted).unwrap();
    assert!(info.connected);
    assert!(info.paused);
    bridge.tcp().set_paused(accepted, false).unwrap();

    // Client -> accepted.
    let sent = bridge.tcp().send(client, &b"ping"[..]).unwrap();
    assert_eq!(sent.recv_timeout(TIMEOUT).unwrap().unwrap(), 4);
    match receives.recv_timeout(TIMEOUT).unwrap() {
        TcpEvent::Receive { socket_id, data } => {
            assert_eq!(socket_id, accepted);
            assert_eq!(&data[..], b"ping");
        }
        other => panic!("expected receive, got {other:?}"),
    }

    // Accepted -> client.
    let sent = bridge.tcp().send(accepted, &b"pong"[..]).unwrap();
    assert_eq!(sent.recv_timeout(TIMEOUT).unwrap().unwrap(), 4);
    match receives.recv_timeout(TIMEOUT).unwrap() {
        TcpEvent::Receive { socket_id, data } => {
            assert_eq!(socket_id, client);
            assert_eq!(&data[..], b"pong");
        }
        other => panic!("expected receive, got {other:?}"),
    }
}

#[test]
fn connect_refused_keeps_socket_until_close() {
    let bridge = init();
    let port = portpicker::pick_unused_port().expect("no free port");

    let client = bridge.tcp().create(SocketConfig::default());
    let connected = bridge.tcp().connect(client, "127.0.0.1", port).unwrap();
    let err = connected
        .recv_timeout(TIMEOUT)
        .unwrap()
        .expect_err("connect must fail");
    assert!(matches!(err, BridgeError::Io(_)));
    assert_eq!(err.result_code(), sockbridge::codes::CONNECTION_REFUSED);

    // The entry survives the failed connect; only an explicit close removes it.
    let info = bridge.tcp().get_info(client).unwrap();
    assert!(!info.connected);

    bridge
        .tcp()
        .close(client)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    assert!(matches!(
        bridge.tcp().get_info(client),
        Err(BridgeError::InvalidArgument(_))
    ));
}

#[test]
fn reconnect_after_disconnect_reuses_id() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let (_server, port) = listening_server(&bridge);

    let client = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(client, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    accepts.recv_timeout(TIMEOUT).unwrap();

    bridge
        .tcp()
        .disconnect(client)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    assert!(!bridge.tcp().get_info(client).unwrap().connected);

    // Same id, fresh handle.
    bridge
        .tcp()
        .connect(client, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    assert!(bridge.tcp().get_info(client).unwrap().connected);
    accepts.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn paused_socket_defers_delivery_until_resumed() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let receives = bridge.tcp().register_receive_events().unwrap();
    let (_server, port) = listening_server(&bridge);

    let client = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(client, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    let accepted = match accepts.recv_timeout(TIMEOUT).unwrap() {
        ServerEvent::Accept {
            client_socket_id, ..
        } => client_socket_id,
        other => panic!("expected accept, got {other:?}"),
    };

    // The accepted socket starts paused; bytes pile up in the kernel.
    for chunk in [&b"first"[..], &b"second"[..]] {
        let sent = bridge.tcp().send(client, chunk).unwrap();
        sent.recv_timeout(TIMEOUT).unwrap().unwrap();
    }
    assert!(
        receives.recv_timeout(QUIET).is_err(),
        "no delivery while paused"
    );

    // Resuming delivers everything, once, in arrival order.
    bridge.tcp().set_paused(accepted, false).unwrap();
    let mut collected = Vec::new();
    while collected.len() < b"firstsecond".len() {
        match receives.recv_timeout(TIMEOUT).unwrap() {
            TcpEvent::Receive { socket_id, data } => {
                assert_eq!(socket_id, accepted);
                collected.extend_from_slice(&data);
            }
            other => panic!("expected receive, got {other:?}"),
        }
    }
    assert_eq!(collected, b"firstsecond");
    assert!(receives.recv_timeout(QUIET).is_err(), "no duplicates");
}

#[test]
fn close_completes_queued_sends_with_cancelled() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let (_server, port) = listening_server(&bridge);

    let client = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(client, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    // Keep the peer paused so nothing ever drains the connection.
    accepts.recv_timeout(TIMEOUT).unwrap();

    // Far more than loopback buffering will take.
    let blob = Bytes::from(vec![0u8; 4 << 20]);
    let handles: Vec<_> = (0..3)
        .map(|_| bridge.tcp().send(client, blob.clone()).unwrap())
        .collect();

    bridge
        .tcp()
        .close(client)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();

    // Every queued send completes - none hang - and the ones still queued at
    // close time come back cancelled.
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.recv_timeout(TIMEOUT).unwrap())
        .collect();
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(BridgeError::Cancelled))));

    assert!(matches!(
        bridge.tcp().get_info(client),
        Err(BridgeError::InvalidArgument(_))
    ));
}

#[test]
fn paused_server_defers_accepts_in_order() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let (server, port) = listening_server(&bridge);

    bridge.tcp_server().set_paused(server, true).unwrap();

    // Connects complete at the OS level while the server ignores them.
    let first = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(first, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    let second = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(second, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();

    assert!(
        accepts.recv_timeout(QUIET).is_err(),
        "no accepts while paused"
    );

    bridge.tcp_server().set_paused(server, false).unwrap();
    for _ in 0..2 {
        match accepts.recv_timeout(TIMEOUT).unwrap() {
            ServerEvent::Accept { socket_id, .. } => assert_eq!(socket_id, server),
            other => panic!("expected accept, got {other:?}"),
        }
    }
}

#[test]
fn buffer_size_bounds_read_chunks() {
    let bridge = init();
    let accepts = bridge.tcp_server().register_accept_events().unwrap();
    let receives = bridge.tcp().register_receive_events().unwrap();
    let (_server, port) = listening_server(&bridge);

    let client = bridge.tcp().create(SocketConfig::default());
    bridge
        .tcp()
        .connect(client, "127.0.0.1", port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    let accepted = match accepts.recv_timeout(TIMEOUT).unwrap() {
        ServerEvent::Accept {
            client_socket_id, ..
        } => client_socket_id,
        other => panic!("expected accept, got {other:?}"),
    };

    bridge
        .tcp()
        .update(accepted, &SocketConfig::new().with_buffer_size(4))
        .unwrap();

    let sent = bridge.tcp().send(client, &b"0123456789"[..]).unwrap();
    sent.recv_timeout(TIMEOUT).unwrap().unwrap();
    bridge.tcp().set_paused(accepted, false).unwrap();

    let mut collected = Vec::new();
    while collected.len() < 10 {
        match receives.recv_timeout(TIMEOUT).unwrap() {
            TcpEvent::Receive { data, .. } => {
                assert!(data.len() <= 4, "reads are bounded by buffer_size");
                collected.extend_from_slice(&data);
            }
            other => panic!("expected receive, got {other:?}"),
        }
    }
    assert_eq!(collected, b"0123456789");
}

#[test]
fn udp_receive_from_reports_source() {
    let bridge = init();
    let events = bridge.udp().register_receive_events().unwrap();

    let receiver = bridge.udp().create(SocketConfig::default());
    bridge.udp().bind(receiver, "127.0.0.1", 0).unwrap();
    let recv_port = bridge
        .udp()
        .get_info(receiver)
        .unwrap()
        .local_port()
        .unwrap();

    let sender = bridge.udp().create(SocketConfig::default());
    bridge.udp().bind(sender, "127.0.0.1", 0).unwrap();
    let send_port = bridge.udp().get_info(sender).unwrap().local_port().unwrap();

    let sent = bridge
        .udp()
        .send_to(sender, &[0x01u8, 0x02][..], "127.0.0.1", recv_port)
        .unwrap();
    assert_eq!(sent.recv_timeout(TIMEOUT).unwrap().unwrap(), 2);

    match events.recv_timeout(TIMEOUT).unwrap() {
        UdpEvent::ReceiveFrom {
            socket_id,
            data,
            remote_addr,
        } => {
            assert_eq!(socket_id, receiver);
            assert_eq!(&data[..], &[0x01, 0x02]);
            assert_eq!(remote_addr.ip().to_string(), "127.0.0.1");
            assert_eq!(remote_addr.port(), send_port);
        }
        other => panic!("expected receive-from, got {other:?}"),
    }
}

#[test]
fn udp_connected_socket_uses_receive() {
    let bridge = init();
    let events = bridge.udp().register_receive_events().unwrap();

    let bound = bridge.udp().create(SocketConfig::default());
    bridge.udp().bind(bound, "127.0.0.1", 0).unwrap();
    let bound_port = bridge.udp().get_info(bound).unwrap().local_port().unwrap();

    // Connect from the unbound state: auto-binds an ephemeral local address.
    let connected = bridge.udp().create(SocketConfig::default());
    bridge
        .udp()
        .connect(connected, "127.0.0.1", bound_port)
        .unwrap()
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();
    let connected_port = bridge
        .udp()
        .get_info(connected)
        .unwrap()
        .local_port()
        .unwrap();

    // Default destination works without an explicit address.
    let sent = bridge.udp().send(connected, &b"hi"[..]).unwrap();
    assert_eq!(sent.recv_timeout(TIMEOUT).unwrap().unwrap(), 2);
    match events.recv_timeout(TIMEOUT).unwrap() {
        UdpEvent::ReceiveFrom { socket_id, .. } => assert_eq!(socket_id, bound),
        other => panic!("expected receive-from, got {other:?}"),
    }

    // Replies to the connected socket surface as plain receive events.
    let sent = bridge
        .udp()
        .send_to(bound, &b"yo"[..], "127.0.0.1", connected_port)
        .unwrap();
    assert_eq!(sent.recv_timeout(TIMEOUT).unwrap().unwrap(), 2);
    match events.recv_timeout(TIMEOUT).unwrap() {
        UdpEvent::Receive { socket_id, data } => {
            assert_eq!(socket_id, connected);
            assert_eq!(&data[..], b"yo");
        }
        other => panic!("expected receive, got {other:?}"),
    }
}

#[test]
fn get_sockets_lists_ascending() {
    let bridge = init();
    for _ in 0..3 {
        bridge.udp().create(SocketConfig::default());
    }
    let infos = bridge.udp().get_sockets();
    assert_eq!(infos.len(), 3);
    assert!(infos.windows(2).all(|w| w[0].socket_id < w[1].socket_id));
}
