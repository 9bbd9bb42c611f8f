//! The one-hop trust policy, end to end over localhost: freshly issued
//! certificates handshake, certificates from a foreign CA do not.

use std::{net::IpAddr, path::Path, sync::Arc};

use overlink::tls::{TlsSettings, client_config, server_config};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsConnector, rustls::pki_types::ServerName};

fn settings(dir: &Path, cert: &str, key: &str, ca: Option<&str>) -> TlsSettings {
    TlsSettings {
        cert: dir.join(cert),
        key: dir.join(key),
        ca: ca.map(|name| dir.join(name)),
    }
}

fn issue_all(dir: &Path) {
    cert::issue::make_server_cert(
        &dir.join("server.pem"),
        &dir.join("server.key"),
        &dir.join("ca.pem"),
        &dir.join("ca.key"),
    )
    .unwrap();

    cert::issue::issue_client_cert(
        &dir.join("ca.pem"),
        &dir.join("ca.key"),
        &dir.join("client.pem"),
        &dir.join("client.key"),
    )
    .unwrap();
}

#[tokio::test]
async fn mutual_auth_handshake_and_echo() {
    let dir = tempfile::tempdir().unwrap();
    issue_all(dir.path());

    let acceptor = TlsAcceptor::from(Arc::new(
        server_config(&settings(dir.path(), "server.pem", "server.key", Some("ca.pem"))).unwrap(),
    ));
    let connector = TlsConnector::from(Arc::new(
        client_config(&settings(dir.path(), "client.pem", "client.key", Some("ca.pem"))).unwrap(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = acceptor.accept(socket).await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream = connector
        .connect(ServerName::from(IpAddr::from([127, 0, 0, 1])), socket)
        .await
        .unwrap();

    stream.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server.await.unwrap();
}

#[tokio::test]
async fn clients_from_a_foreign_ca_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    issue_all(dir.path());

    // A second, unrelated CA issues the client's certificate.
    let foreign = tempfile::tempdir().unwrap();
    issue_all(foreign.path());

    let acceptor = TlsAcceptor::from(Arc::new(
        server_config(&settings(dir.path(), "server.pem", "server.key", Some("ca.pem"))).unwrap(),
    ));

    // The client skips verification of the server entirely (no CA); only its
    // own, foreign-signed certificate is at issue.
    let connector = TlsConnector::from(Arc::new(
        client_config(&settings(foreign.path(), "client.pem", "client.key", None)).unwrap(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        assert!(acceptor.accept(socket).await.is_err());
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let connected = connector
        .connect(ServerName::from(IpAddr::from([127, 0, 0, 1])), socket)
        .await;

    // The rejection can surface at connect time or on the first read,
    // depending on when the server's alert lands.
    let failed = match connected {
        Err(_) => true,
        Ok(mut stream) => stream.read_exact(&mut [0u8; 1]).await.is_err(),
    };
    assert!(failed);

    server.await.unwrap();
}
