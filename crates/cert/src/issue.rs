//! Certificate issuance.
//!
//! A CA and server pair come out of `make_server_cert`; client leaves are
//! signed against that CA by `issue_client_cert`. Everything is RSA-2048 with
//! a six month validity window. rcgen signs but does not generate RSA key
//! material, so keys come from the `rsa` crate and are handed over as PKCS#8.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256,
    SerialNumber,
};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, LineEnding},
};
use time::{Duration, OffsetDateTime};

/// Certificates are valid for six months from issuance.
const VALIDITY: Duration = Duration::days(183);

const KEY_BITS: usize = 2048;

/// Generate an RSA private key as PKCS#8 PEM. Anything under 2048 bits is
/// refused.
pub fn generate_rsa_key_pem(bits: usize) -> Result<String> {
    if bits < 2048 {
        bail!("too few bits when generating key");
    }

    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits).context("generating RSA key")?;
    Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

/// Common shape of every certificate issued here: fixed subject, six month
/// validity, both client and server EKU.
fn basic_params(now: OffsetDateTime) -> CertificateParams {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "U.S");
    dn.push(DnType::OrganizationName, "Acme Co.");
    dn.push(DnType::OrganizationalUnitName, "Acme Co.U");

    // Serial numbers and subject key ids only need statistical spread, so a
    // plain 63-bit random value is enough.
    let skid = (rand::random::<u64>() >> 1).to_le_bytes();

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>() >> 1));
    params.key_identifier_method = KeyIdMethod::PreSpecified(skid[..5].to_vec());
    params.not_before = now;
    params.not_after = now + VALIDITY;
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];

    params
}

fn issue_leaf(now: OffsetDateTime, ca: &Certificate, ca_key: &KeyPair) -> Result<(Certificate, String)> {
    let key_pem = generate_rsa_key_pem(KEY_BITS)?;
    let key = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;

    let mut params = basic_params(now);
    params.is_ca = IsCa::ExplicitNoCa;
    let cert = params.signed_by(&key, ca, ca_key)?;

    Ok((cert, key_pem))
}

/// Generate a fresh CA and a server certificate signed by it, writing all
/// four PEM files to the given paths.
pub fn make_server_cert<P: AsRef<Path>>(
    server_cert_path: P,
    server_key_path: P,
    ca_cert_path: P,
    ca_key_path: P,
) -> Result<()> {
    let now = OffsetDateTime::now_utc();

    let ca_key_pem = generate_rsa_key_pem(KEY_BITS)?;
    let ca_key = KeyPair::from_pem_and_sign_algo(&ca_key_pem, &PKCS_RSA_SHA256)?;

    let mut ca_params = basic_params(now);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let (server_cert, server_key_pem) = issue_leaf(now, &ca_cert, &ca_key)?;

    fs::write(server_cert_path, server_cert.pem())?;
    fs::write(server_key_path, &server_key_pem)?;
    fs::write(ca_cert_path, ca_cert.pem())?;
    fs::write(ca_key_path, &ca_key_pem)?;

    Ok(())
}

/// Sign a new client certificate with an existing CA.
pub fn issue_client_cert<P: AsRef<Path>>(
    ca_cert_path: P,
    ca_key_path: P,
    client_cert_path: P,
    client_key_path: P,
) -> Result<()> {
    let ca_key_pem = fs::read_to_string(ca_key_path).context("reading CA key")?;
    let ca_key = KeyPair::from_pem_and_sign_algo(&ca_key_pem, &PKCS_RSA_SHA256)?;

    let ca_pem = fs::read_to_string(ca_cert_path).context("reading CA certificate")?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&ca_pem)?.self_signed(&ca_key)?;

    let (cert, key_pem) = issue_leaf(OffsetDateTime::now_utc(), &ca_cert, &ca_key)?;

    fs::write(client_cert_path, cert.pem())?;
    fs::write(client_key_path, &key_pem)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn small_keys_are_refused() {
        assert!(generate_rsa_key_pem(1024).is_err());
    }

    #[test]
    fn issued_chain_verifies_one_hop() {
        let dir = tempfile::tempdir().unwrap();
        let server_cert = dir.path().join("server.pem");
        let server_key = dir.path().join("server.key");
        let ca_cert = dir.path().join("ca.pem");
        let ca_key = dir.path().join("ca.key");

        make_server_cert(&server_cert, &server_key, &ca_cert, &ca_key).unwrap();

        let client_cert = dir.path().join("client.pem");
        let client_key = dir.path().join("client.key");
        issue_client_cert(&ca_cert, &ca_key, &client_cert, &client_key).unwrap();

        let ca_der = crate::load_cert_der(&ca_cert).unwrap();
        let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
        let constraints = ca
            .basic_constraints()
            .unwrap()
            .expect("CA carries basic constraints");
        assert!(constraints.value.ca);

        for path in [&server_cert, &client_cert] {
            let der = crate::load_cert_der(path).unwrap();
            let (_, leaf) = X509Certificate::from_der(&der).unwrap();

            assert!(leaf.verify_signature(Some(ca.public_key())).is_ok());
            assert!(leaf.validity().is_valid());
            assert!(leaf.subject().to_string().contains("Acme Co."));
        }
    }

    #[test]
    fn leaf_does_not_verify_against_wrong_ca() {
        let dir = tempfile::tempdir().unwrap();
        let paths = |n: &str| dir.path().join(n);

        make_server_cert(
            &paths("s1.pem"),
            &paths("s1.key"),
            &paths("ca1.pem"),
            &paths("ca1.key"),
        )
        .unwrap();
        make_server_cert(
            &paths("s2.pem"),
            &paths("s2.key"),
            &paths("ca2.pem"),
            &paths("ca2.key"),
        )
        .unwrap();

        let leaf_der = crate::load_cert_der(paths("s1.pem")).unwrap();
        let other_ca_der = crate::load_cert_der(paths("ca2.pem")).unwrap();

        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        let (_, other_ca) = X509Certificate::from_der(&other_ca_der).unwrap();

        assert!(leaf.verify_signature(Some(other_ca.public_key())).is_err());
    }
}
