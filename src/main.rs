#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::exit;

use anyhow::Result;
use overlink::{
    client::{Client, ClientOptions},
    config::{Cli, Mode},
    server::{Server, ServerOptions},
};

#[tokio::main]
async fn main() {
    let cli = Cli::load();

    if let Err(e) = simple_logger::init_with_level(log::Level::Info) {
        eprintln!("could not initialize logging: {e}");
        exit(1);
    }

    if let Err(e) = run(cli.mode).await {
        log::error!("{e:#}");
        exit(1);
    }
}

async fn run(mode: Mode) -> Result<()> {
    match mode {
        Mode::Client(args) => {
            if let Some(crl) = &args.crl {
                cert::crl::init_crl(crl)?;
            }

            let client = Client::new(ClientOptions {
                tls: args.tls(),
                server_host: args.server_host,
                port: args.port,
                network: args.network,
                interface_name: args.interface,
                gateway: args.gw,
                manual: args.manual,
            })
            .await?;

            client.init().await?;
            client.run().await?;

            wait_for_signal().await?;
            client.close().await;
        }
        Mode::Server(args) => {
            if let Some(crl) = &args.crl {
                cert::crl::init_crl(crl)?;
            }

            let server = Server::new(ServerOptions {
                tls: args.tls(),
                host: args.server_host,
                port: args.port,
                network: args.network,
                interface_name: args.interface,
            })
            .await?;

            server.run().await?;

            wait_for_signal().await?;
            server.close().await;
        }
        Mode::InitServerCerts(args) => {
            cert::issue::make_server_cert(&args.cert, &args.key, &args.ca, &args.ca_key)?;
        }
        Mode::MakeClientCert(args) => {
            cert::issue::issue_client_cert(&args.ca, &args.ca_key, &args.cert_path, &args.key_path)?;
        }
        Mode::BlacklistCert(args) => {
            cert::crl::add_to_crl(&args.crl, &args.cert_path, &args.justification)?;
        }
    }

    Ok(())
}

/// Block until SIGINT or SIGTERM; a clean shutdown follows.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
