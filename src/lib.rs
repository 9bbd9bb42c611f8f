//! A TLS-authenticated layer-3 VPN.
//!
//! The server multiplexes IPv4 packets between connected clients over
//! mutually-authenticated TLS control channels, routing on the tunnel
//! addresses clients advertise and falling through to its local TUN device
//! for everything else. Each connection can additionally negotiate an
//! AES-256-GCM encrypted UDP datapath for bulk traffic.
//!
//! The binary front-end lives in `main.rs`; everything here is exported so
//! integration tests can drive the server pieces directly.

pub mod client;
pub mod config;
pub mod constants;
pub mod netcfg;
pub mod ports;
pub mod server;
pub mod tls;
pub mod tun;
