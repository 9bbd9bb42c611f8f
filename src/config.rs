use std::{net::Ipv4Addr, path::PathBuf, process::exit};

use clap::{Args, Parser, Subcommand, error::ErrorKind};
use ipnet::Ipv4Net;

use crate::tls::TlsSettings;

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Connect to a server and join its network.
    Client(ClientArgs),
    /// Serve a network to connecting clients.
    Server(ServerArgs),
    /// Generate a CA plus a server certificate signed by it.
    InitServerCerts(InitServerCertsArgs),
    /// Issue a client certificate from an existing CA.
    MakeClientCert(MakeClientCertArgs),
    /// Add a certificate to the revocation list.
    BlacklistCert(BlacklistCertArgs),
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server to connect to.
    pub server_host: String,

    /// Path to PEM-encoded cert for our side of the connection.
    #[arg(long)]
    pub cert: PathBuf,

    /// Path to PEM-encoded key for our cert.
    #[arg(long)]
    pub key: PathBuf,

    /// Path to PEM-encoded cert used to validate the peer.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Port for the VPN connection.
    #[arg(long, default_value_t = 3234)]
    pub port: u16,

    /// Address for this interface, with netmask.
    #[arg(long, default_value = "192.168.69.1/24")]
    pub network: Ipv4Net,

    /// TUN interface name; one is picked if not specified.
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Replace the default route, restoring through this gateway on exit.
    #[arg(long)]
    pub gw: Option<Ipv4Addr>,

    /// Path to the certificate revocation list to watch.
    #[arg(long)]
    pub crl: Option<PathBuf>,

    /// Leave routes and the default gateway alone.
    #[arg(long)]
    pub manual: bool,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to listen on.
    pub server_host: String,

    /// Path to PEM-encoded cert for our side of the connection.
    #[arg(long)]
    pub cert: PathBuf,

    /// Path to PEM-encoded key for our cert.
    #[arg(long)]
    pub key: PathBuf,

    /// Path to PEM-encoded cert used to validate clients.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Port for the VPN connection.
    #[arg(long, default_value_t = 3234)]
    pub port: u16,

    /// Address for this interface, with netmask.
    #[arg(long, default_value = "192.168.69.1/24")]
    pub network: Ipv4Net,

    /// TUN interface name; one is picked if not specified.
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Path to the certificate revocation list to watch.
    #[arg(long)]
    pub crl: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InitServerCertsArgs {
    /// Where to write the server certificate.
    #[arg(long)]
    pub cert: PathBuf,

    /// Where to write the server key.
    #[arg(long)]
    pub key: PathBuf,

    /// Where to write the CA certificate.
    #[arg(long)]
    pub ca: PathBuf,

    /// Where to write the CA key.
    #[arg(long)]
    pub ca_key: PathBuf,
}

#[derive(Args, Debug)]
pub struct MakeClientCertArgs {
    /// Path to the CA certificate.
    #[arg(long)]
    pub ca: PathBuf,

    /// Path to the CA key.
    #[arg(long)]
    pub ca_key: PathBuf,

    /// Where to write the issued certificate.
    pub cert_path: PathBuf,

    /// Where to write the issued key.
    pub key_path: PathBuf,
}

#[derive(Args, Debug)]
pub struct BlacklistCertArgs {
    /// Path to the certificate revocation list.
    #[arg(long)]
    pub crl: PathBuf,

    /// Certificate to blacklist.
    pub cert_path: PathBuf,

    /// Why the certificate is being revoked.
    pub justification: String,
}

impl Cli {
    /// Parse the command line. Usage errors exit with 2, an unknown mode
    /// with 3 (help and version exit cleanly).
    pub fn load() -> Self {
        match Self::try_parse() {
            Ok(cli) => cli,
            Err(e) if e.kind() == ErrorKind::InvalidSubcommand => {
                let _ = e.print();
                exit(3);
            }
            Err(e) => e.exit(),
        }
    }
}

impl ClientArgs {
    pub fn tls(&self) -> TlsSettings {
        TlsSettings {
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca: self.ca.clone(),
        }
    }
}

impl ServerArgs {
    pub fn tls(&self) -> TlsSettings {
        TlsSettings {
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca: self.ca.clone(),
        }
    }
}
