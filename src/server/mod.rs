//! The VPN server.
//!
//! One listener, one dispatcher, one TUN device. Each accepted client gets
//! its own connection record, outbound queues, and a private UDP port for the
//! datapath. The dispatcher routes every inbound packet either to the client
//! owning its destination address or out the local TUN.

pub mod conn;
pub mod router;

pub use router::{InboundPacket, Router};

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use codec::IpPacket;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::mpsc::{Receiver, Sender, channel},
    task::JoinHandle,
    time::{sleep, timeout},
};
use ::tun::AsyncDevice;
use tokio_rustls::TlsAcceptor;

use self::conn::ServerConn;
use crate::{
    constants::{
        ACCEPT_TIMEOUT, PKT_IN_MAX_BUFF, PKT_OUT_MAX_BUFF, SERV_MAX_INBOUND_QUEUE,
        SERV_PER_CLIENT_QUEUE, STREAM_READ_TIMEOUT,
    },
    netcfg,
    ports::PortPool,
    tls::{self, TlsSettings},
    tun,
};

pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Tunnel address and netmask of the server's own TUN interface.
    pub network: Ipv4Net,
    pub interface_name: Option<String>,
    pub tls: TlsSettings,
}

/// Everything `run` consumes exactly once.
struct RunParts {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tun_reader: ReadHalf<AsyncDevice>,
    tun_writer: WriteHalf<AsyncDevice>,
    inbound_rx: Receiver<InboundPacket>,
    tun_in_tx: Sender<IpPacket>,
    tun_in_rx: Receiver<IpPacket>,
    tun_out_rx: Receiver<IpPacket>,
}

pub struct Server {
    shutdown: Arc<AtomicBool>,
    pub(crate) router: Arc<Router>,
    pub(crate) ports: Arc<PortPool>,
    pub(crate) inbound_tx: Sender<InboundPacket>,
    tun_name: String,
    local_addr: SocketAddr,
    parts: Mutex<Option<RunParts>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listener, open the TUN device and assign its address.
    pub async fn new(options: ServerOptions) -> Result<Arc<Self>> {
        let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&options.tls)?));

        let listener = TcpListener::bind((options.host.as_str(), options.port))
            .await
            .with_context(|| format!("binding {}:{}", options.host, options.port))?;
        let local_addr = listener.local_addr()?;

        let (tun_name, device) = tun::open(options.interface_name.as_deref())?;
        log::info!("created interface {tun_name}");

        netcfg::set_dev_ip(&tun_name, options.network.addr(), options.network.prefix_len()).await?;
        log::info!(
            "ip of {tun_name} set to {}, netmask {}",
            options.network.addr(),
            options.network.netmask()
        );

        let (tun_reader, tun_writer) = tokio::io::split(device);
        let (inbound_tx, inbound_rx) = channel(SERV_MAX_INBOUND_QUEUE);
        let (tun_in_tx, tun_in_rx) = channel(PKT_IN_MAX_BUFF);
        let (tun_out_tx, tun_out_rx) = channel(PKT_OUT_MAX_BUFF);

        Ok(Arc::new(Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            router: Arc::new(Router::new(tun_out_tx)),
            ports: Arc::new(PortPool::new()),
            inbound_tx,
            tun_name,
            local_addr,
            parts: Mutex::new(Some(RunParts {
                listener,
                acceptor,
                tun_reader,
                tun_writer,
                inbound_rx,
                tun_in_tx,
                tun_in_rx,
                tun_out_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Bring the interface up and start the accept, dispatch and device
    /// tasks.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let parts = self.parts.lock().take().context("server already running")?;

        netcfg::set_interface_status(&self.tun_name, true).await?;

        let handles = vec![
            tokio::spawn(accept_task(self.clone(), parts.listener, parts.acceptor)),
            tokio::spawn(dispatch_task(
                self.clone(),
                parts.inbound_rx,
                parts.tun_in_rx,
            )),
            tokio::spawn(tun::read_task(
                self.tun_name.clone(),
                parts.tun_reader,
                parts.tun_in_tx,
                self.shutdown.clone(),
            )),
            tokio::spawn(tun::write_task(
                self.tun_name.clone(),
                parts.tun_writer,
                parts.tun_out_rx,
                self.shutdown.clone(),
            )),
        ];

        *self.tasks.lock() = handles;

        log::info!(
            "server listening: addr={}, dev={}",
            self.local_addr,
            self.tun_name
        );

        Ok(())
    }

    /// Signal shutdown and wait for the long-running tasks to observe it.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let abort = handle.abort_handle();
            if timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }

        log::info!("server shut down");
    }

    fn handle_client(
        self: &Arc<Self>,
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        address: SocketAddr,
    ) {
        let (ip_tx, ip_rx) = channel(SERV_PER_CLIENT_QUEUE);
        let (udp_info_tx, udp_info_rx) = channel(4);

        let id = self.router.insert(ip_tx);
        let conn = Arc::new(ServerConn {
            id,
            peer: address,
            udp_port: self.ports.get(),
            send_key: rand::random(),
            recv_key: Mutex::new(None),
            remote_addr: Mutex::new(None),
            udp_peer: Mutex::new(None),
            has_udp_key: AtomicBool::new(false),
            has_udp_addr: AtomicBool::new(false),
            connection_ok: AtomicBool::new(true),
            udp_info_queue: udp_info_tx,
        });

        log::info!("new connection from {address} ({id})");

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(conn::read_task(conn.clone(), self.clone(), read_half));
        tokio::spawn(conn::write_task(
            conn.clone(),
            self.clone(),
            write_half,
            ip_rx,
            udp_info_rx,
        ));
        tokio::spawn(conn::udp_task(conn, self.clone()));
    }
}

/// Accept loop. The deadline keeps it polling the shutdown flag; the TLS
/// handshake runs in its own task so a slow peer cannot stall accepts.
async fn accept_task(server: Arc<Server>, listener: TcpListener, acceptor: TlsAcceptor) {
    while !server.is_shutting_down() {
        let (socket, address) = match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                if !server.is_shutting_down() {
                    log::error!("listener err: {e}");
                }

                return;
            }
        };

        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed!: addr={address}, err={e}");
        }

        let server = server.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(socket).await {
                Ok(stream) => server.handle_client(stream, address),
                Err(e) => log::warn!("tls handshake failed: addr={address}, err={e}"),
            }
        });
    }
}

/// Central dispatch: one consumer over both inbound queues, no ordering
/// between them.
async fn dispatch_task(
    server: Arc<Server>,
    mut inbound: Receiver<InboundPacket>,
    mut tun_in: Receiver<IpPacket>,
) {
    while !server.is_shutting_down() {
        tokio::select! {
            received = inbound.recv() => match received {
                Some(InboundPacket { pkt, .. }) => server.router.route(pkt),
                None => break,
            },
            received = tun_in.recv() => match received {
                Some(pkt) => server.router.route(pkt),
                None => break,
            },
            _ = sleep(STREAM_READ_TIMEOUT) => {}
        }
    }
}
