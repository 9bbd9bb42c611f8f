//! Routing behavior, driven against the server's router with injected
//! client queues standing in for live connections.

use std::net::Ipv4Addr;

use bytes::Bytes;
use codec::IpPacket;
use overlink::server::Router;
use tokio::sync::mpsc::channel;

fn packet(dest: [u8; 4]) -> IpPacket {
    let mut raw = vec![0u8; 64];
    raw[0] = 0x45;
    raw[9] = 17;
    raw[16..20].copy_from_slice(&dest);
    IpPacket::parse(Bytes::from(raw)).unwrap()
}

#[test]
fn packets_between_clients_never_touch_the_device() {
    let (tun_out, mut tun_rx) = channel(16);
    let router = Router::new(tun_out);

    let (queue_a, mut rx_a) = channel(16);
    let (queue_b, mut rx_b) = channel(16);

    let a = router.insert(queue_a);
    let b = router.insert(queue_b);
    router.bind_addr(a, Ipv4Addr::new(10, 0, 0, 2));
    router.bind_addr(b, Ipv4Addr::new(10, 0, 0, 3));

    // A packet from client A towards client B's tunnel address.
    let sent = packet([10, 0, 0, 3]);
    router.route(sent.clone());

    let delivered = rx_b.try_recv().unwrap();
    assert_eq!(delivered.raw, sent.raw);

    assert!(rx_a.try_recv().is_err());
    assert!(tun_rx.try_recv().is_err());
}

#[test]
fn unknown_destination_falls_through_to_the_device_once() {
    let (tun_out, mut tun_rx) = channel(16);
    let router = Router::new(tun_out);

    let (queue_a, mut rx_a) = channel(16);
    let a = router.insert(queue_a);
    router.bind_addr(a, Ipv4Addr::new(10, 0, 0, 2));

    router.route(packet([10, 0, 0, 99]));

    assert!(tun_rx.try_recv().is_ok());
    assert!(tun_rx.try_recv().is_err());
    assert!(rx_a.try_recv().is_err());
}

#[test]
fn multicast_is_delivered_nowhere() {
    let (tun_out, mut tun_rx) = channel(16);
    let router = Router::new(tun_out);

    let (queue_a, mut rx_a) = channel(16);
    let a = router.insert(queue_a);
    // Even a client claiming a multicast address never receives it.
    router.bind_addr(a, Ipv4Addr::new(224, 0, 0, 1));

    router.route(packet([224, 0, 0, 1]));

    assert!(rx_a.try_recv().is_err());
    assert!(tun_rx.try_recv().is_err());
}

#[test]
fn full_client_queue_drops_instead_of_falling_through() {
    let (tun_out, mut tun_rx) = channel(16);
    let router = Router::new(tun_out);

    let (queue_a, mut rx_a) = channel(1);
    let a = router.insert(queue_a);
    router.bind_addr(a, Ipv4Addr::new(10, 0, 0, 2));

    router.route(packet([10, 0, 0, 2]));
    router.route(packet([10, 0, 0, 2]));

    // The first packet made it, the second was dropped, and neither was
    // rerouted to the device.
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_a.try_recv().is_err());
    assert!(tun_rx.try_recv().is_err());
}

#[test]
fn rebinding_after_removal_routes_to_the_new_connection() {
    let (tun_out, _tun_rx) = channel(16);
    let router = Router::new(tun_out);

    let addr = Ipv4Addr::new(10, 0, 0, 2);

    let (queue_a, mut rx_a) = channel(16);
    let a = router.insert(queue_a);
    router.bind_addr(a, addr);
    router.remove(a);

    // The same client reconnects under a new id and re-announces.
    let (queue_b, mut rx_b) = channel(16);
    let b = router.insert(queue_b);
    router.bind_addr(b, addr);

    router.route(packet([10, 0, 0, 2]));
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_ok());
}
