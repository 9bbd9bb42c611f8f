//! Certificate material for the tunnel trust path.
//!
//! Trust is a chain of one: every peer certificate must be signed directly by
//! the configured CA, be inside its validity window, and not appear on the
//! CRL. The CRL is a JSON file of blacklisted public keys re-read at runtime,
//! so a compromised client can be cut off without restarting the server.
//!
//! This crate owns the file formats: PEM loading, CA and leaf issuance, and
//! the CRL itself. The TLS-level enforcement lives with the transport.

pub mod crl;
pub mod issue;

use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use x509_parser::prelude::*;

/// Read a PEM-encoded certificate and return its DER bytes.
pub fn load_cert_der<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let data = fs::read(path.as_ref())
        .with_context(|| format!("reading certificate {:?}", path.as_ref()))?;

    let block = ::pem::parse(&data).context("no certificate data read from PEM")?;
    if block.tag() != "CERTIFICATE" {
        return Err(anyhow!("expected a CERTIFICATE block, found {}", block.tag()));
    }

    Ok(block.contents().to_vec())
}

/// PKIX-DER subject public key of a PEM-encoded certificate.
///
/// This is the byte string the CRL stores and compares against.
pub fn cert_public_key<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let der = load_cert_der(path)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| anyhow!("parsing certificate: {e}"))?;

    Ok(cert.public_key().raw.to_vec())
}
