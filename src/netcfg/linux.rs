use std::net::Ipv4Addr;

use anyhow::{Result, anyhow};

use super::command_exec;

/// Bring a network interface up or down.
pub async fn set_interface_status(name: &str, up: bool) -> Result<()> {
    let status = if up { "up" } else { "down" };
    command_exec("ip", &["link", "set", "dev", name, status, "qlen", "100"]).await
}

/// Set the local address and prefix of a network interface.
pub async fn set_dev_ip(name: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let cidr = format!("{addr}/{prefix_len}");
    command_exec("ip", &["addr", "add", &cidr, "dev", name]).await
}

/// Route all traffic for `dest` via `via` on the given interface.
pub async fn add_route(dest: Ipv4Addr, via: Ipv4Addr, dev: &str) -> Result<()> {
    let dest = dest.to_string();
    let via = via.to_string();
    command_exec("ip", &["route", "add", &dest, "via", &via, "dev", dev]).await
}

/// Remove a route previously installed with [`add_route`].
pub async fn del_route(dest: Ipv4Addr, via: Ipv4Addr, dev: &str) -> Result<()> {
    let dest = dest.to_string();
    let via = via.to_string();
    command_exec("ip", &["route", "del", &dest, "via", &via, "dev", dev]).await
}

/// Point the system default route at the given gateway and interface.
pub async fn set_default_gateway(gw: Ipv4Addr, dev: &str) -> Result<()> {
    let gw = gw.to_string();
    command_exec("ip", &["route", "replace", "default", "via", &gw, "dev", dev]).await
}

/// Restore a bare default route. Used at teardown, after the tunnel
/// interface is already gone.
pub async fn add_default_route(gw: Ipv4Addr) -> Result<()> {
    let gw = gw.to_string();
    command_exec("ip", &["route", "replace", "default", "via", &gw]).await
}

/// Current default gateway and the interface it lives on.
pub async fn get_net_gateway() -> Result<(Ipv4Addr, String)> {
    let table = tokio::fs::read_to_string("/proc/net/route").await?;
    parse_route_table(&table).ok_or_else(|| anyhow!("no default route in /proc/net/route"))
}

/// `/proc/net/route` is a whitespace table of hex fields; the default route
/// is the RTF_GATEWAY entry with destination zero. Addresses are stored in
/// little-endian byte order.
fn parse_route_table(table: &str) -> Option<(Ipv4Addr, String)> {
    const RTF_GATEWAY: u16 = 0x2;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let Ok(flags) = u16::from_str_radix(fields[3], 16) else {
            continue;
        };

        if fields[1] != "00000000" || flags & RTF_GATEWAY == 0 {
            continue;
        }

        let Ok(gw) = u32::from_str_radix(fields[2], 16) else {
            continue;
        };

        return Some((Ipv4Addr::from(gw.to_le_bytes()), fields[0].to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        eth0\t000AFEA9\t00000000\t0001\t0\t0\t0\t00C0FFFF\t0\t0\t0\n\
        eth0\t00000000\t0102A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n";

    #[test]
    fn finds_the_default_gateway() {
        let (gw, dev) = parse_route_table(TABLE).unwrap();
        assert_eq!(gw, Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(dev, "eth0");
    }

    #[test]
    fn ignores_tables_without_default_route() {
        let table = "Iface\tDestination\tGateway \tFlags\n\
            eth0\t000AFEA9\t00000000\t0001\n";
        assert!(parse_route_table(table).is_none());
    }
}
