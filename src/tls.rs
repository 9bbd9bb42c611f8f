//! TLS configuration for the control channel.
//!
//! Both sides speak TLS 1.2+ restricted to AES-256-GCM suites. The builtin
//! chain and hostname verification never runs: trust is decided entirely by
//! the custom verifier, which accepts a peer certificate iff it is signed
//! directly by the configured CA (a chain of one), is inside its validity
//! window, and its public key is not on the CRL. Without a CA configured no
//! verification happens at all, loudly.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName,
    Error as TlsError, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
    server::danger::{ClientCertVerified, ClientCertVerifier},
    version,
};
use x509_parser::prelude::*;

/// Paths to this side's certificate, key, and the optional CA used to
/// validate the peer.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Option<PathBuf>,
}

fn provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        kx_groups: vec![
            aws_lc_rs::kx_group::SECP384R1,
            aws_lc_rs::kx_group::SECP256R1,
        ],
        ..aws_lc_rs::default_provider()
    }
}

/// The whole trust decision for a peer, both directions.
#[derive(Debug)]
struct PeerVerifier {
    /// DER of the CA certificate, or `None` to accept anything.
    ca_der: Option<Vec<u8>>,
    provider: Arc<CryptoProvider>,
    root_hints: Vec<DistinguishedName>,
}

impl PeerVerifier {
    fn verify_peer(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let Some(ca_der) = &self.ca_der else {
            return Ok(());
        };

        let (_, leaf) = X509Certificate::from_der(end_entity)
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
        let (_, ca) = X509Certificate::from_der(ca_der)
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;

        // Chain of one: the peer certificate must be signed by the CA itself,
        // intermediates are never consulted.
        let mut verdict = leaf
            .verify_signature(Some(ca.public_key()))
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadSignature));

        if verdict.is_ok() && !leaf.validity().is_valid() {
            verdict = Err(TlsError::InvalidCertificate(CertificateError::Expired));
        }

        if verdict.is_ok() {
            if let Err(e) = cert::crl::check_crl(leaf.public_key().raw) {
                verdict = Err(TlsError::General(e.to_string()));
            }
        }

        log::info!(
            "remote presented certificate {} with time bounds ({} - {}), verification: {:?}",
            leaf.serial,
            leaf.validity().not_before,
            leaf.validity().not_after,
            verdict
        );

        verdict
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.verify_peer(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for PeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.verify_peer(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn verifier(settings: &TlsSettings, provider: Arc<CryptoProvider>) -> Result<PeerVerifier> {
    let ca_der = match &settings.ca {
        Some(path) => Some(cert::load_cert_der(path)?),
        None => {
            log::warn!(
                "no CA certificate specified, skipping TLS verification of peers. This is bad!"
            );
            None
        }
    };

    Ok(PeerVerifier {
        ca_der,
        provider,
        root_hints: Vec::new(),
    })
}

fn load_cert_chain(settings: &TlsSettings) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = CertificateDer::pem_file_iter(&settings.cert)
        .with_context(|| format!("reading certificate {:?}", settings.cert))?
        .collect::<Result<Vec<_>, _>>()?;

    let key = PrivateKeyDer::from_pem_file(&settings.key)
        .with_context(|| format!("reading private key {:?}", settings.key))?;

    Ok((certs, key))
}

/// TLS configuration for the listening side. Client certificates are
/// required exactly when a CA is configured.
pub fn server_config(settings: &TlsSettings) -> Result<ServerConfig> {
    let provider = Arc::new(provider());
    let (certs, key) = load_cert_chain(settings)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])?;

    let verifier = verifier(settings, provider)?;
    Ok(if verifier.ca_der.is_some() {
        builder
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    })
}

/// TLS configuration for the dialing side. The custom verifier replaces the
/// builtin one unconditionally; servers are never validated against webpki
/// roots or their hostname.
pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let provider = Arc::new(provider());
    let (certs, key) = load_cert_chain(settings)?;
    let verifier = verifier(settings, provider.clone())?;

    Ok(ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)?)
}
