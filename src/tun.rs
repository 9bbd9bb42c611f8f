//! TUN device glue.
//!
//! The device hands us one IPv4 datagram per read. Each datagram is copied
//! into its own buffer before being queued, so a slow consumer never sees its
//! packet overwritten by the next read.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use codec::IpPacket;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc::{Receiver, Sender},
    time::timeout,
};
use ::tun::{AsyncDevice, Configuration, Device as _};

use crate::constants::{DEV_MTU, DEV_PKT_BUFF_SIZE, STREAM_READ_TIMEOUT};

/// Create the TUN device, optionally with a preferred name. Addressing is
/// left to the host configuration layer.
pub fn open(preferred_name: Option<&str>) -> anyhow::Result<(String, AsyncDevice)> {
    let mut config = Configuration::default();
    if let Some(name) = preferred_name {
        config.name(name);
    }

    config.mtu(DEV_MTU);

    #[cfg(target_os = "linux")]
    config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = ::tun::create_as_async(&config)?;
    let name = device.get_ref().name()?;

    Ok((name, device))
}

/// Pump datagrams from the device into `packets_in` until the device fails
/// or the process shuts down. Non-IPv4 traffic is dropped here.
pub async fn read_task(
    name: String,
    mut device: ReadHalf<AsyncDevice>,
    packets_in: Sender<IpPacket>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; DEV_PKT_BUFF_SIZE];

    while !shutdown.load(Ordering::Relaxed) {
        let n = match device.read(&mut buffer).await {
            Ok(n) => n,
            Err(e) => {
                if !shutdown.load(Ordering::Relaxed) {
                    log::error!("{name} read err: {e}");
                }

                return;
            }
        };

        let packet = match IpPacket::parse(Bytes::copy_from_slice(&buffer[..n])) {
            Ok(packet) => packet,
            Err(_) => continue,
        };

        if packets_in.send(packet).await.is_err() {
            return;
        }
    }
}

/// Drain `packets_out` onto the device.
pub async fn write_task(
    name: String,
    mut device: WriteHalf<AsyncDevice>,
    mut packets_out: Receiver<IpPacket>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        // The deadline keeps the loop polling the shutdown flag even when the
        // tunnel is idle.
        let packet = match timeout(STREAM_READ_TIMEOUT, packets_out.recv()).await {
            Err(_) => continue,
            Ok(None) => return,
            Ok(Some(packet)) => packet,
        };

        if let Err(e) = device.write_all(&packet.raw).await {
            if !shutdown.load(Ordering::Relaxed) {
                log::error!("{name} write err: {e}");
            }

            return;
        }
    }
}
