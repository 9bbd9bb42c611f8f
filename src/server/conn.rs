//! Per-client connection state and tasks.
//!
//! Every accepted connection runs three tasks: a TLS read task feeding the
//! central dispatcher, a TLS write task draining the client's outbound
//! queues, and a UDP task listening on the client's private datapath port.
//! The first error latches `connection_ok` and removes the client; the write
//! task owns the stream teardown, the read side only marks the failure.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use codec::{Decoder, Encoder, IpPacket, MAX_MESSAGE_SIZE, Message, UdpInfo, crypto};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket},
    sync::mpsc::{Receiver, Sender},
    time::{sleep, timeout},
};
use tokio_rustls::server::TlsStream;

use super::{InboundPacket, Server};
use crate::constants::{DEV_PKT_BUFF_SIZE, SERVER_UDP_READ_TIMEOUT, STREAM_READ_TIMEOUT};

pub struct ServerConn {
    pub id: u64,
    /// TLS-level peer address, for logs only.
    pub peer: SocketAddr,
    /// Datapath listen port, owned until the connection dies.
    pub udp_port: u16,
    /// Key this side encrypts server-to-client datagrams with; announced to
    /// the client in the very first message.
    pub send_key: [u8; 32],
    /// Key the client announced for its own traffic; absent until its
    /// `UdpInfo` arrives.
    pub recv_key: Mutex<Option<[u8; 32]>>,
    /// Tunnel address the client advertised with `LocalAddr`.
    pub remote_addr: Mutex<Option<Ipv4Addr>>,
    /// Where the client's datagrams actually come from.
    pub udp_peer: Mutex<Option<SocketAddr>>,
    pub has_udp_key: AtomicBool,
    pub has_udp_addr: AtomicBool,
    pub connection_ok: AtomicBool,
    /// Handle for queueing control messages to this client.
    pub udp_info_queue: Sender<UdpInfo>,
}

impl ServerConn {
    fn running(&self, server: &Server) -> bool {
        self.connection_ok.load(Ordering::Relaxed) && !server.is_shutting_down()
    }

    /// Latch the failure and drop the client from the routing tables. Only
    /// the first caller does the removal.
    pub(super) fn had_error(&self, server: &Server) {
        if self.connection_ok.swap(false, Ordering::SeqCst) {
            server.router.remove(self.id);
            log::info!("client removed: id={}, addr={}", self.id, self.peer);
        }
    }
}

pub(super) async fn write_task(
    conn: Arc<ServerConn>,
    server: Arc<Server>,
    mut stream: WriteHalf<TlsStream<TcpStream>>,
    mut ip_rx: Receiver<IpPacket>,
    mut udp_rx: Receiver<UdpInfo>,
) {
    let mut buf = BytesMut::with_capacity(DEV_PKT_BUFF_SIZE + 64);

    // The client learns our datapath endpoint and send key before anything
    // else flows.
    Encoder::encode(
        &Message::UdpInfo(UdpInfo {
            port: conn.udp_port,
            key: conn.send_key,
        }),
        &mut buf,
    );

    if let Err(e) = stream.write_all(&buf).await {
        log::error!("write error for {}: {e}", conn.peer);
        conn.had_error(&server);
        return;
    }

    while conn.running(&server) {
        let message = tokio::select! {
            pkt = ip_rx.recv() => match pkt {
                Some(pkt) => Message::IpPkt(pkt),
                None => break,
            },
            info = udp_rx.recv() => match info {
                Some(info) => Message::UdpInfo(info),
                None => break,
            },
            _ = sleep(STREAM_READ_TIMEOUT) => continue,
        };

        buf.clear();
        Encoder::encode(&message, &mut buf);
        if let Err(e) = stream.write_all(&buf).await {
            log::error!("write error for {}: {e}", conn.peer);
            break;
        }
    }

    conn.had_error(&server);
}

pub(super) async fn read_task(
    conn: Arc<ServerConn>,
    server: Arc<Server>,
    mut stream: ReadHalf<TlsStream<TcpStream>>,
) {
    let mut buffer = BytesMut::with_capacity(MAX_MESSAGE_SIZE * 2);

    'conn: while conn.running(&server) {
        match timeout(STREAM_READ_TIMEOUT, stream.read_buf(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if !server.is_shutting_down() {
                    log::error!("client read error: id={}, err={e}", conn.id);
                }

                break;
            }
        }

        // A well-behaved peer never gets this far ahead of the decoder.
        if buffer.len() > MAX_MESSAGE_SIZE * 3 {
            log::warn!("client stream overflow: id={}, len={}", conn.id, buffer.len());
            break;
        }

        loop {
            let size = match Decoder::message_size(&buffer) {
                Ok(None) => break,
                Ok(Some(size)) if size > buffer.len() => break,
                Ok(Some(size)) => size,
                Err(e) => {
                    log::error!("client stream decode failed: id={}, err={e}", conn.id);
                    break 'conn;
                }
            };

            let frame = buffer.split_to(size);
            let message = match Decoder::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("client message decode failed: id={}, err={e}", conn.id);
                    break 'conn;
                }
            };

            match message {
                Message::LocalAddr(addr) => {
                    *conn.remote_addr.lock() = Some(addr);
                    server.router.bind_addr(conn.id, addr);
                    log::info!("client advertised tunnel address: id={}, addr={addr}", conn.id);
                }
                Message::UdpInfo(info) => {
                    *conn.recv_key.lock() = Some(info.key);
                    conn.has_udp_key.store(true, Ordering::SeqCst);
                }
                Message::IpPkt(pkt) => {
                    let inbound = InboundPacket {
                        pkt,
                        client_id: conn.id,
                    };

                    if server.inbound_tx.send(inbound).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }
    }

    conn.had_error(&server);
}

/// The client's private datapath listener. Datagrams that fail
/// authentication are dropped one at a time; the connection itself only dies
/// with the TLS session.
pub(super) async fn udp_task(conn: Arc<ServerConn>, server: Arc<Server>) {
    let socket = match UdpSocket::bind(("0.0.0.0", conn.udp_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("udp listen failed: port={}, err={e}", conn.udp_port);
            server.ports.free(conn.udp_port);
            return;
        }
    };

    let mut buffer = vec![0u8; DEV_PKT_BUFF_SIZE];

    while conn.running(&server) {
        let (n, addr) = match timeout(SERVER_UDP_READ_TIMEOUT, socket.recv_from(&mut buffer)).await
        {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                log::warn!("udp read error: port={}, err={e}", conn.udp_port);
                break;
            }
        };

        let Some(key) = *conn.recv_key.lock() else {
            log::warn!("udp packet before key exchange: id={}, dropping", conn.id);
            continue;
        };

        let plaintext = match crypto::open(&key, &buffer[..n]) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                log::warn!("udp packet failed authentication: id={}, dropping", conn.id);
                continue;
            }
        };

        *conn.udp_peer.lock() = Some(addr);
        if !conn.has_udp_addr.swap(true, Ordering::SeqCst) {
            log::info!("udp datapath active: id={}, addr={addr}", conn.id);
        }

        let pkt = match IpPacket::parse(Bytes::from(plaintext)) {
            Ok(pkt) => pkt,
            Err(_) => continue,
        };

        let inbound = InboundPacket {
            pkt,
            client_id: conn.id,
        };

        if server.inbound_tx.send(inbound).await.is_err() {
            break;
        }
    }

    server.ports.free(conn.udp_port);
}
