//! The VPN client.
//!
//! A client keeps exactly one TLS session to the server, reopened with
//! quadratic backoff whenever it fails, and pumps packets between the local
//! TUN device and the network. Bulk traffic migrates from the ordered TLS
//! stream onto the encrypted UDP datapath as soon as both sides have
//! exchanged keys; control messages stay on TLS.
//!
//! The first task to observe a transport failure performs the reconnect.
//! Everyone else parks on the `connection_ok` latch, drops whatever it had
//! buffered, and picks up the fresh stream by watching the session
//! generation counter.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use codec::{Decoder, Encoder, IpPacket, MAX_MESSAGE_SIZE, Message, UdpInfo, crypto};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket, lookup_host},
    sync::mpsc::{Receiver, Sender, channel},
    task::JoinHandle,
    time::{sleep, timeout},
};
use ::tun::AsyncDevice;
use tokio_rustls::{TlsConnector, client::TlsStream, rustls::pki_types::ServerName};

use crate::{
    constants::{
        CLIENT_UDP_READ_TIMEOUT, DEV_PKT_BUFF_SIZE, ERROR_PAUSE, PKT_IN_MAX_BUFF,
        PKT_OUT_MAX_BUFF, STREAM_READ_TIMEOUT,
    },
    netcfg::{self, Reverser},
    tls::{self, TlsSettings},
    tun,
};

pub struct ClientOptions {
    pub server_host: String,
    pub port: u16,
    /// Tunnel address and netmask for this client's TUN interface.
    pub network: Ipv4Net,
    pub interface_name: Option<String>,
    /// Replace the system default route with the tunnel, restoring through
    /// this gateway at shutdown.
    pub gateway: Option<Ipv4Addr>,
    /// Leave all routing to the operator.
    pub manual: bool,
    pub tls: TlsSettings,
}

type Reader = ReadHalf<TlsStream<TcpStream>>;
type Writer = WriteHalf<TlsStream<TcpStream>>;

/// The reconnectable TLS session. Halves are parked here between owners; the
/// generation counter tells the tasks when a fresh pair is waiting.
struct Session {
    connection_ok: AtomicBool,
    generation: AtomicU64,
    reset_lock: tokio::sync::Mutex<()>,
    reader_slot: tokio::sync::Mutex<Option<Reader>>,
    writer_slot: tokio::sync::Mutex<Option<Writer>>,
}

/// UDP datapath state, populated by the in-band key exchange.
struct Datapath {
    initialized: AtomicBool,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Key we seal outbound datagrams with; announced to the server.
    send_key: Mutex<Option<[u8; 32]>>,
    /// Key the server announced for its own traffic.
    recv_key: Mutex<Option<[u8; 32]>>,
    /// The server's per-client datapath port.
    server_port: Mutex<Option<u16>>,
}

struct RunChannels {
    pkt_in_tx: Sender<IpPacket>,
    pkt_in_rx: Receiver<IpPacket>,
    tun_out_tx: Sender<IpPacket>,
    tun_out_rx: Receiver<IpPacket>,
    ctl_tx: Sender<UdpInfo>,
    ctl_rx: Receiver<UdpInfo>,
}

pub struct Client {
    shutdown: Arc<AtomicBool>,
    server_ip: IpAddr,
    server_port: u16,
    local_addr: Ipv4Addr,
    network: Ipv4Net,
    gateway: Option<Ipv4Addr>,
    manual: bool,
    tun_name: String,
    connector: TlsConnector,
    session: Session,
    datapath: Datapath,
    reverser: Mutex<Option<Reverser>>,
    device: Mutex<Option<AsyncDevice>>,
    channels: Mutex<Option<RunChannels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Resolve the server, open the TUN device and prepare the TLS dialer.
    pub async fn new(options: ClientOptions) -> Result<Arc<Self>> {
        let connector = TlsConnector::from(Arc::new(tls::client_config(&options.tls)?));
        let server_ip = resolve(&options.server_host, options.port).await?;

        let (tun_name, device) = tun::open(options.interface_name.as_deref())?;
        log::info!("created interface with name {tun_name}");

        let (pkt_in_tx, pkt_in_rx) = channel(PKT_IN_MAX_BUFF);
        let (tun_out_tx, tun_out_rx) = channel(PKT_OUT_MAX_BUFF);
        let (ctl_tx, ctl_rx) = channel(4);

        Ok(Arc::new(Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            server_ip,
            server_port: options.port,
            local_addr: options.network.addr(),
            network: options.network,
            gateway: options.gateway,
            manual: options.manual,
            tun_name,
            connector,
            session: Session {
                connection_ok: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reset_lock: tokio::sync::Mutex::new(()),
                reader_slot: tokio::sync::Mutex::new(None),
                writer_slot: tokio::sync::Mutex::new(None),
            },
            datapath: Datapath {
                initialized: AtomicBool::new(false),
                socket: Mutex::new(None),
                send_key: Mutex::new(None),
                recv_key: Mutex::new(None),
                server_port: Mutex::new(None),
            },
            reverser: Mutex::new(Some(Reverser::default())),
            device: Mutex::new(Some(device)),
            channels: Mutex::new(Some(RunChannels {
                pkt_in_tx,
                pkt_in_rx,
                tun_out_tx,
                tun_out_rx,
                ctl_tx,
                ctl_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Dial the server and apply host configuration: the device address, and
    /// a pinned route to the server via the old default gateway when this
    /// client is about to take the default route over.
    pub async fn init(&self) -> Result<()> {
        let stream = self.dial().await?;
        let (reader, writer) = tokio::io::split(stream);
        *self.session.reader_slot.lock().await = Some(reader);
        *self.session.writer_slot.lock().await = Some(writer);
        self.session.generation.store(1, Ordering::SeqCst);
        self.session.connection_ok.store(true, Ordering::SeqCst);

        netcfg::set_dev_ip(&self.tun_name, self.local_addr, self.network.prefix_len()).await?;
        log::info!(
            "ip of {} set to {}, netmask {}",
            self.tun_name,
            self.local_addr,
            self.network.netmask()
        );

        if self.gateway.is_some() && !self.manual {
            let IpAddr::V4(server_v4) = self.server_ip else {
                return Err(anyhow!("gateway override requires an IPv4 server address"));
            };

            // Traffic to the server itself must keep using the old gateway,
            // or the tunnel would try to carry its own transport.
            let (old_gw, old_dev) = netcfg::get_net_gateway().await?;
            netcfg::add_route(server_v4, old_gw, &old_dev).await?;

            if let Some(reverser) = self.reverser.lock().as_mut() {
                reverser.add_route_entry(server_v4, old_gw, &old_dev);

                #[cfg(target_os = "macos")]
                reverser.reset_gateway_osx(old_gw);
            }
        }

        Ok(())
    }

    /// Bring the device up, move the default route if asked to, and start
    /// the four long-running tasks.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let channels = self
            .channels
            .lock()
            .take()
            .context("client already running")?;
        let device = self.device.lock().take().context("device missing")?;

        netcfg::set_interface_status(&self.tun_name, true).await?;

        if !self.manual {
            if let Some(gw) = self.gateway {
                netcfg::set_default_gateway(gw, &self.tun_name).await?;
            }
        }

        let (tun_reader, tun_writer) = tokio::io::split(device);
        let handles = vec![
            tokio::spawn(tun::read_task(
                self.tun_name.clone(),
                tun_reader,
                channels.pkt_in_tx,
                self.shutdown.clone(),
            )),
            tokio::spawn(tun::write_task(
                self.tun_name.clone(),
                tun_writer,
                channels.tun_out_rx,
                self.shutdown.clone(),
            )),
            tokio::spawn(send_task(
                self.clone(),
                channels.pkt_in_rx,
                channels.ctl_rx,
            )),
            tokio::spawn(recv_task(
                self.clone(),
                channels.tun_out_tx,
                channels.ctl_tx,
            )),
        ];

        *self.tasks.lock() = handles;

        log::info!(
            "client running: server={}:{}, dev={}",
            self.server_ip,
            self.server_port,
            self.tun_name
        );

        Ok(())
    }

    /// Signal shutdown, wait for the tasks (and with them the TUN device) to
    /// go away, then unwind the host configuration.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            // A task stuck in a deadline-less read is cut loose so the TUN
            // device is truly gone before the gateway is restored.
            let abort = handle.abort_handle();
            if timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }

        if let Some(reverser) = self.reverser.lock().take() {
            reverser.close().await;
        }

        log::info!("client shut down");
    }

    /// Open a fresh TLS session. The first message on every new session
    /// announces our tunnel address so the server can (re)bind it.
    async fn dial(&self) -> Result<TlsStream<TcpStream>> {
        let socket = TcpStream::connect((self.server_ip, self.server_port)).await?;
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed!: err={e}");
        }

        let mut stream = self
            .connector
            .connect(ServerName::from(self.server_ip), socket)
            .await?;

        let mut buf = BytesMut::new();
        Encoder::encode(&Message::LocalAddr(self.local_addr), &mut buf);
        stream.write_all(&buf).await?;

        Ok(stream)
    }

    /// Reconnect after a transport failure. Only the first task to report a
    /// given generation does the work; the backoff grows quadratically and
    /// never gives up while the process lives.
    async fn connection_problem(&self, generation_seen: u64) {
        let _guard = self.session.reset_lock.lock().await;

        if self.session.generation.load(Ordering::SeqCst) != generation_seen {
            return;
        }

        self.session.connection_ok.store(false, Ordering::SeqCst);
        *self.session.reader_slot.lock().await = None;
        *self.session.writer_slot.lock().await = None;

        // The datapath dies with the session: the server forgets our keys
        // when the connection drops, so the next session re-runs the
        // exchange from scratch.
        self.datapath.initialized.store(false, Ordering::SeqCst);
        *self.datapath.socket.lock() = None;
        *self.datapath.server_port.lock() = None;

        let mut attempt: u64 = 0;
        loop {
            if pause_for(Duration::from_secs(attempt * attempt * 5), &self.shutdown).await {
                return;
            }

            log::info!(
                "attempting connection to {}:{}",
                self.server_ip,
                self.server_port
            );

            match self.dial().await {
                Ok(stream) => {
                    let (reader, writer) = tokio::io::split(stream);
                    *self.session.reader_slot.lock().await = Some(reader);
                    *self.session.writer_slot.lock().await = Some(writer);
                    self.session.generation.fetch_add(1, Ordering::SeqCst);
                    self.session.connection_ok.store(true, Ordering::SeqCst);
                    log::info!("connection re-established");
                    return;
                }
                Err(e) => {
                    log::warn!("connect failed: {e}");
                    attempt += 1;
                }
            }
        }
    }

    /// The datapath is usable once the exchange finished and the server's
    /// port is known.
    fn datapath_socket(&self) -> Option<(Arc<UdpSocket>, [u8; 32])> {
        if !self.datapath.initialized.load(Ordering::Relaxed) {
            return None;
        }

        self.datapath.server_port.lock().as_ref()?;
        let socket = self.datapath.socket.lock().clone()?;
        let key = (*self.datapath.send_key.lock())?;
        Some((socket, key))
    }

    /// React to the server's `UdpInfo`. The first one triggers our side of
    /// the exchange: generate a send key, reply with it and our local port,
    /// and start the UDP receive task.
    async fn handle_udp_info(
        self: &Arc<Self>,
        info: UdpInfo,
        ctl_tx: &Sender<UdpInfo>,
        tun_out: &Sender<IpPacket>,
    ) {
        *self.datapath.recv_key.lock() = Some(info.key);
        *self.datapath.server_port.lock() = Some(info.port);

        if self.datapath.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.start_datapath(info.port).await {
            Ok((socket, local_port)) => {
                let send_key = rand::random::<[u8; 32]>();
                *self.datapath.send_key.lock() = Some(send_key);
                *self.datapath.socket.lock() = Some(socket.clone());

                let reply = UdpInfo {
                    port: local_port,
                    key: send_key,
                };

                if ctl_tx.send(reply).await.is_err() {
                    self.datapath.initialized.store(false, Ordering::SeqCst);
                    return;
                }

                tokio::spawn(udp_recv_task(self.clone(), socket, tun_out.clone()));
                log::info!(
                    "udp datapath initialized: server_port={}, local_port={local_port}",
                    info.port
                );
            }
            Err(e) => {
                log::warn!("udp datapath setup failed: {e}");
                self.datapath.initialized.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn start_datapath(&self, port: u16) -> Result<(Arc<UdpSocket>, u16)> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((self.server_ip, port)).await?;
        let local_port = socket.local_addr()?.port();
        Ok((Arc::new(socket), local_port))
    }
}

async fn resolve(host: &str, port: u16) -> Result<IpAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("could not resolve {host}"))?
        .collect();

    let addr = addrs
        .choose(&mut rand::rng())
        .ok_or_else(|| anyhow!("could not resolve {host}"))?;

    Ok(addr.ip())
}

/// Sleep in short slices so shutdown is never waiting on a long backoff.
/// Returns true once the process is shutting down.
async fn pause_for(duration: Duration, shutdown: &AtomicBool) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = duration;

    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }

        let step = remaining.min(slice);
        sleep(step).await;
        remaining -= step;
    }

    shutdown.load(Ordering::Relaxed)
}

enum Outbound {
    Pkt(IpPacket),
    Ctl(UdpInfo),
}

/// Drain the TUN-in and control queues towards the server, over UDP when the
/// datapath is up and TLS otherwise.
async fn send_task(client: Arc<Client>, mut pkt_rx: Receiver<IpPacket>, mut ctl_rx: Receiver<UdpInfo>) {
    let mut writer: Option<Writer> = None;
    let mut generation = 0u64;
    let mut buf = BytesMut::with_capacity(DEV_PKT_BUFF_SIZE + 64);

    while !client.shutdown.load(Ordering::Relaxed) {
        if !client.session.connection_ok.load(Ordering::Relaxed) {
            // Stale packets must not flood the next session.
            while pkt_rx.try_recv().is_ok() {}
            while ctl_rx.try_recv().is_ok() {}
            sleep(ERROR_PAUSE).await;
            continue;
        }

        let current = client.session.generation.load(Ordering::Relaxed);
        if generation != current {
            writer = client.session.writer_slot.lock().await.take();
            generation = current;
        }

        let Some(stream) = writer.as_mut() else {
            sleep(ERROR_PAUSE).await;
            continue;
        };

        let outbound = tokio::select! {
            info = ctl_rx.recv() => match info {
                Some(info) => Outbound::Ctl(info),
                None => break,
            },
            pkt = pkt_rx.recv() => match pkt {
                Some(pkt) => Outbound::Pkt(pkt),
                None => break,
            },
            _ = sleep(STREAM_READ_TIMEOUT) => continue,
        };

        let message = match outbound {
            Outbound::Pkt(pkt) => {
                if let Some((socket, key)) = client.datapath_socket() {
                    match crypto::seal(&key, &pkt.raw) {
                        Ok(datagram) => {
                            if let Err(e) = socket.send(&datagram).await {
                                log::warn!("udp send failed: {e}");
                            }
                        }
                        Err(e) => log::warn!("udp seal failed: {e}"),
                    }

                    continue;
                }

                Message::IpPkt(pkt)
            }
            Outbound::Ctl(info) => Message::UdpInfo(info),
        };

        buf.clear();
        Encoder::encode(&message, &mut buf);

        if let Err(e) = stream.write_all(&buf).await {
            log::error!("write error: {e}");
            writer = None;
            client.connection_problem(generation).await;
            while pkt_rx.try_recv().is_ok() {}
            while ctl_rx.try_recv().is_ok() {}
            sleep(ERROR_PAUSE).await;
        }
    }
}

/// Decode the server's stream: packets towards the TUN device, control
/// messages into the datapath state machine.
async fn recv_task(client: Arc<Client>, tun_out: Sender<IpPacket>, ctl_tx: Sender<UdpInfo>) {
    let mut reader: Option<Reader> = None;
    let mut generation = 0u64;
    let mut buffer = BytesMut::with_capacity(MAX_MESSAGE_SIZE * 2);

    'outer: while !client.shutdown.load(Ordering::Relaxed) {
        if !client.session.connection_ok.load(Ordering::Relaxed) {
            sleep(ERROR_PAUSE).await;
            continue;
        }

        let current = client.session.generation.load(Ordering::Relaxed);
        if generation != current {
            reader = client.session.reader_slot.lock().await.take();
            generation = current;
            buffer.clear();
        }

        let Some(stream) = reader.as_mut() else {
            sleep(ERROR_PAUSE).await;
            continue;
        };

        match timeout(STREAM_READ_TIMEOUT, stream.read_buf(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                log::error!("server closed the connection");
                reader = None;
                buffer.clear();
                client.connection_problem(generation).await;
                sleep(ERROR_PAUSE).await;
                continue;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if !client.shutdown.load(Ordering::Relaxed) {
                    log::error!("read error: {e}");
                }

                reader = None;
                buffer.clear();
                client.connection_problem(generation).await;
                sleep(ERROR_PAUSE).await;
                continue;
            }
        }

        loop {
            let size = match Decoder::message_size(&buffer) {
                Ok(None) => break,
                Ok(Some(size)) if size > buffer.len() => break,
                Ok(Some(size)) => size,
                Err(e) => {
                    log::error!("server stream decode failed: {e}");
                    reader = None;
                    buffer.clear();
                    client.connection_problem(generation).await;
                    sleep(ERROR_PAUSE).await;
                    continue 'outer;
                }
            };

            let frame = buffer.split_to(size);
            match Decoder::decode(&frame) {
                Ok(Message::IpPkt(pkt)) => {
                    if tun_out.send(pkt).await.is_err() {
                        break 'outer;
                    }
                }
                Ok(Message::UdpInfo(info)) => {
                    client.handle_udp_info(info, &ctl_tx, &tun_out).await;
                }
                // The server never announces a tunnel address.
                Ok(Message::LocalAddr(_)) => {}
                Err(e) => {
                    log::error!("server message decode failed: {e}");
                    reader = None;
                    buffer.clear();
                    client.connection_problem(generation).await;
                    sleep(ERROR_PAUSE).await;
                    continue 'outer;
                }
            }
        }
    }
}

/// Receive the server's datagrams on the connected socket, decrypt and hand
/// them to the TUN writer. Ends with the datapath torn down; a later
/// `UdpInfo` from the server starts a fresh one.
async fn udp_recv_task(client: Arc<Client>, socket: Arc<UdpSocket>, tun_out: Sender<IpPacket>) {
    let mut buffer = vec![0u8; DEV_PKT_BUFF_SIZE];

    loop {
        if client.shutdown.load(Ordering::Relaxed)
            || !client.datapath.initialized.load(Ordering::Relaxed)
        {
            break;
        }

        let n = match timeout(CLIENT_UDP_READ_TIMEOUT, socket.recv(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                log::warn!("udp read error: {e}");
                break;
            }
        };

        let Some(key) = *client.datapath.recv_key.lock() else {
            continue;
        };

        let plaintext = match crypto::open(&key, &buffer[..n]) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                log::warn!("udp packet failed authentication, dropping");
                continue;
            }
        };

        let Ok(pkt) = IpPacket::parse(Bytes::from(plaintext)) else {
            continue;
        };

        if tun_out.send(pkt).await.is_err() {
            break;
        }
    }

    client.datapath.initialized.store(false, Ordering::SeqCst);
    *client.datapath.socket.lock() = None;
}
