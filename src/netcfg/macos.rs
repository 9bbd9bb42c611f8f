use std::net::Ipv4Addr;

use anyhow::{Result, anyhow};

use super::command_exec;
use crate::constants::DEV_MTU;

/// Bring a network interface up or down.
pub async fn set_interface_status(name: &str, up: bool) -> Result<()> {
    let status = if up { "up" } else { "down" };
    let mtu = DEV_MTU.to_string();
    command_exec("ifconfig", &[name, status, "mtu", &mtu]).await
}

/// Set the local address and netmask of a network interface.
pub async fn set_dev_ip(name: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let addr = addr.to_string();
    let mask = match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n))),
    }
    .to_string();

    command_exec("ifconfig", &[name, "inet", &addr, &addr, "netmask", &mask]).await
}

/// Route all traffic for `dest` via `via`, scoped to the given interface.
pub async fn add_route(dest: Ipv4Addr, via: Ipv4Addr, dev: &str) -> Result<()> {
    let dest = dest.to_string();
    let via = via.to_string();
    command_exec("route", &["-n", "add", &dest, &via, "-ifscope", dev]).await
}

/// Remove a route previously installed with [`add_route`].
pub async fn del_route(dest: Ipv4Addr, via: Ipv4Addr, dev: &str) -> Result<()> {
    let dest = dest.to_string();
    let via = via.to_string();
    command_exec("route", &["-n", "delete", &dest, &via, "-ifscope", dev]).await
}

/// Point the system default route at the given interface.
pub async fn set_default_gateway(_gw: Ipv4Addr, dev: &str) -> Result<()> {
    command_exec("route", &["-n", "change", "default", "-interface", dev]).await
}

/// Restore a bare default route. Used at teardown, after the tunnel
/// interface is already gone.
pub async fn add_default_route(gw: Ipv4Addr) -> Result<()> {
    let gw = gw.to_string();
    command_exec("route", &["add", "default", &gw]).await
}

/// Current default gateway and the interface it lives on, parsed out of
/// `route -n get default`.
pub async fn get_net_gateway() -> Result<(Ipv4Addr, String)> {
    let output = tokio::process::Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .await?;

    let text = String::from_utf8_lossy(&output.stdout);

    let mut gateway = None;
    let mut interface = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key.trim() {
            "gateway" => gateway = value.trim().parse::<Ipv4Addr>().ok(),
            "interface" => interface = Some(value.trim().to_string()),
            _ => {}
        }
    }

    match (gateway, interface) {
        (Some(gw), Some(dev)) => Ok((gw, dev)),
        _ => Err(anyhow!("could not read gateway or interface")),
    }
}
