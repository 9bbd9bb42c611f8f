//! The packet router.
//!
//! Both client maps (tunnel address to id, id to outbound queue) and the id
//! counter live behind one lock; every insertion, removal, address binding
//! and lookup-plus-enqueue happens under it. Enqueues are non-blocking so the
//! lock's tail latency stays bounded: the router prefers dropping a packet to
//! stalling dispatch behind one slow client.

use std::net::Ipv4Addr;

use ahash::HashMap;
use codec::IpPacket;
use parking_lot::Mutex;
use tokio::sync::mpsc::{Sender, error::TrySendError};

/// An IP packet paired with the connection that delivered it. Exists only
/// inside the server for accounting; never crosses the wire.
pub struct InboundPacket {
    pub pkt: IpPacket,
    pub client_id: u64,
}

#[derive(Default)]
struct ClientTable {
    id_by_addr: HashMap<Ipv4Addr, u64>,
    clients: HashMap<u64, Sender<IpPacket>>,
    last_client_id: u64,
}

pub struct Router {
    table: Mutex<ClientTable>,
    tun_out: Sender<IpPacket>,
}

impl Router {
    pub fn new(tun_out: Sender<IpPacket>) -> Self {
        Self {
            table: Mutex::new(ClientTable::default()),
            tun_out,
        }
    }

    /// Enroll a new connection and assign its id.
    pub fn insert(&self, queue: Sender<IpPacket>) -> u64 {
        let mut table = self.table.lock();
        let id = table.last_client_id;
        table.last_client_id += 1;
        table.clients.insert(id, queue);
        id
    }

    /// Bind an advertised tunnel address to a connection. A re-announcement
    /// under a different address leaves the previous binding in place until
    /// the connection goes away.
    pub fn bind_addr(&self, id: u64, addr: Ipv4Addr) {
        self.table.lock().id_by_addr.insert(addr, id);
    }

    pub fn remove(&self, id: u64) {
        let mut table = self.table.lock();
        table.id_by_addr.retain(|_, bound| *bound != id);
        table.clients.remove(&id);
    }

    /// Deliver one packet: to the owning client if its address is bound,
    /// otherwise out the local TUN device. Multicast is dropped outright.
    pub fn route(&self, pkt: IpPacket) {
        if pkt.is_multicast() {
            return;
        }

        {
            let table = self.table.lock();
            if let Some(id) = table.id_by_addr.get(&pkt.dest) {
                match table.clients.get(id) {
                    Some(queue) => match queue.try_send(pkt) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            log::warn!("client queue full: id={id}, dropping packet");
                        }
                        Err(TrySendError::Closed(_)) => {
                            log::warn!("client queue closed: id={id}, dropping packet");
                        }
                    },
                    None => {
                        log::warn!("no connection for routed client id {id}, dropping packet");
                    }
                }

                // A bound address is always terminal, even when the packet
                // had to be dropped; it never falls through to the device.
                return;
            }
        }

        if self.tun_out.try_send(pkt).is_err() {
            log::warn!("device queue full, dropping packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc::channel;

    fn packet(dest: [u8; 4]) -> IpPacket {
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[9] = 17;
        raw[16..20].copy_from_slice(&dest);
        IpPacket::parse(Bytes::from(raw)).unwrap()
    }

    #[test]
    fn ids_are_monotonic() {
        let (tun_out, _keep) = channel(1);
        let router = Router::new(tun_out);

        let (queue, _rx) = channel(1);
        assert_eq!(router.insert(queue.clone()), 0);
        assert_eq!(router.insert(queue), 1);
    }

    #[test]
    fn removal_evicts_the_address_binding() {
        let (tun_out, mut tun_rx) = channel(8);
        let router = Router::new(tun_out);

        let (queue, mut rx) = channel(8);
        let id = router.insert(queue);
        router.bind_addr(id, Ipv4Addr::new(10, 0, 0, 2));

        router.route(packet([10, 0, 0, 2]));
        assert!(rx.try_recv().is_ok());

        router.remove(id);

        // With the binding gone the packet falls through to the device.
        router.route(packet([10, 0, 0, 2]));
        assert!(rx.try_recv().is_err());
        assert!(tun_rx.try_recv().is_ok());
    }

    #[test]
    fn bound_address_implies_live_binding() {
        let (tun_out, _keep) = channel(1);
        let router = Router::new(tun_out);

        let (queue, _rx) = channel(1);
        let a = router.insert(queue.clone());
        let b = router.insert(queue);

        router.bind_addr(a, Ipv4Addr::new(10, 0, 0, 2));
        router.bind_addr(b, Ipv4Addr::new(10, 0, 0, 3));
        router.remove(a);

        let table = router.table.lock();
        for (addr, id) in table.id_by_addr.iter() {
            assert!(table.clients.contains_key(id), "stale binding for {addr}");
        }
    }
}
