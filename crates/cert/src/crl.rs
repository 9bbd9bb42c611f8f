//! The certificate revocation list.
//!
//! A JSON array of blacklisted public keys kept at a configured path. The
//! process loads it once at startup and then re-reads it every two minutes,
//! swapping in a whole new snapshot each time; verification takes the latest
//! snapshot and never blocks the refresh. A read error preserves the prior
//! copy.

use std::{fs, io, path::Path, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// One blacklisted public key, with the reason it was revoked and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub justification: String,
    #[serde(with = "base64_der")]
    pub public_key: Vec<u8>,
    #[serde(rename = "timestamp")]
    pub added_epoch: i64,
}

/// The JSON file stores keys as base64 of their PKIX-DER encoding.
mod base64_der {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        STANDARD
            .decode(String::deserialize(deserializer)?)
            .map_err(serde::de::Error::custom)
    }
}

static CRL: RwLock<Option<Arc<Vec<BlacklistEntry>>>> = RwLock::new(None);

/// A certificate's public key matched a CRL entry.
#[derive(Debug)]
pub struct CrlMatch {
    pub index: usize,
    pub justification: String,
}

impl std::error::Error for CrlMatch {}

impl std::fmt::Display for CrlMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CRL match at index {} - justification {:?}",
            self.index, self.justification
        )
    }
}

fn read_crl(path: &Path) -> io::Result<Vec<BlacklistEntry>> {
    serde_json::from_slice(&fs::read(path)?).map_err(io::Error::other)
}

/// Load the CRL at `path` and start the refresh loop.
///
/// The initial read is synchronous so a bad path fails startup; afterwards
/// the file is re-read every two minutes on a background thread.
pub fn init_crl<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref().to_path_buf();
    *CRL.write() = Some(Arc::new(read_crl(&path)?));

    thread::spawn(move || {
        loop {
            thread::sleep(REFRESH_INTERVAL);

            match read_crl(&path) {
                Ok(entries) => *CRL.write() = Some(Arc::new(entries)),
                Err(e) => log::error!("failed to read CRL file: path={path:?}, err={e}"),
            }
        }
    });

    Ok(())
}

/// Returns an error iff the PKIX-DER public key appears on the current CRL
/// snapshot. A process with no CRL loaded accepts everything.
pub fn check_crl(spki_der: &[u8]) -> Result<(), CrlMatch> {
    let Some(snapshot) = CRL.read().clone() else {
        return Ok(());
    };

    for (index, entry) in snapshot.iter().enumerate() {
        if entry.public_key == spki_der {
            return Err(CrlMatch {
                index,
                justification: entry.justification.clone(),
            });
        }
    }

    Ok(())
}

/// Blacklist the certificate at `cert_path`, atomically replacing the CRL
/// file. A missing CRL file is treated as empty.
pub fn add_to_crl<P: AsRef<Path>>(crl_path: P, cert_path: P, justification: &str) -> Result<()> {
    let crl_path = crl_path.as_ref();
    let public_key = crate::cert_public_key(cert_path)?;

    let mut entries = match read_crl(crl_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("reading CRL {crl_path:?}")),
    };

    entries.push(BlacklistEntry {
        justification: justification.to_string(),
        public_key,
        added_epoch: unix_now(),
    });

    let data = serde_json::to_string_pretty(&entries)?;
    let staged = crl_path.with_extension("tmp");
    fs::write(&staged, data)?;
    fs::rename(&staged, crl_path).context("replacing CRL file")?;

    Ok(())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrips_through_json() {
        let entry = BlacklistEntry {
            justification: "leaked key".to_string(),
            public_key: vec![1, 2, 3, 4],
            added_epoch: 1700000000,
        };

        let json = serde_json::to_string_pretty(&[entry]).unwrap();
        assert!(json.contains("\"timestamp\": 1700000000"));
        assert!(json.contains("AQIDBA=="));

        let parsed: Vec<BlacklistEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].public_key, vec![1, 2, 3, 4]);
        assert_eq!(parsed[0].justification, "leaked key");
    }

    // The CRL snapshot is process-wide state, so the whole lifecycle runs in
    // one test: load an empty list, blacklist a freshly issued certificate,
    // reload, and watch the check flip.
    #[test]
    fn blacklisting_is_observed_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let crl_path = dir.path().join("crl.json");
        let ca_cert = dir.path().join("ca.pem");
        let ca_key = dir.path().join("ca.key");
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client.key");

        crate::issue::make_server_cert(
            &dir.path().join("server.pem"),
            &dir.path().join("server.key"),
            &ca_cert,
            &ca_key,
        )
        .unwrap();
        crate::issue::issue_client_cert(&ca_cert, &ca_key, &cert, &key).unwrap();

        fs::write(&crl_path, "[]").unwrap();
        init_crl(&crl_path).unwrap();

        let spki = crate::cert_public_key(&cert).unwrap();
        assert!(check_crl(&spki).is_ok());

        add_to_crl(&crl_path, &cert, "compromised during test").unwrap();

        // The refresh loop would pick this up within two minutes; reload
        // directly rather than waiting for it.
        init_crl(&crl_path).unwrap();

        let err = check_crl(&spki).unwrap_err();
        assert_eq!(err.index, 0);
        assert_eq!(err.justification, "compromised during test");

        // An unrelated key is still fine.
        assert!(check_crl(&[0u8; 16]).is_ok());
    }
}
