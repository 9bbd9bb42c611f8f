//! Authenticated encryption for the UDP datapath.
//!
//! Each direction of a tunnel has its own 32-byte key, exchanged in-band over
//! the TLS control stream. Datagrams are sealed with AES-256-GCM under a
//! fresh random nonce, which travels in the clear ahead of the ciphertext.
//! Decryption failure drops the single datagram; the datapath is
//! loss-tolerant by design.

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, NONCE_LEN, UnboundKey};

use crate::Error;

/// Size of a 32-byte datapath key.
pub const KEY_LEN: usize = 32;

fn key(key: &[u8; KEY_LEN]) -> Result<LessSafeKey, Error> {
    Ok(LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| Error::CryptoFailed)?,
    ))
}

/// Encrypt one datagram: random nonce, then ciphertext and tag.
///
/// # Test
///
/// ```
/// use overlink_codec::crypto::{open, seal};
///
/// let k = [1u8; 32];
/// let sealed = seal(&k, b"datagram").unwrap();
/// assert_eq!(open(&k, &sealed).unwrap(), b"datagram");
/// ```
pub fn seal(key_bytes: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let key = key(key_bytes)?;

    let mut nonce = [0u8; NONCE_LEN];
    aws_lc_rs::rand::fill(&mut nonce).map_err(|_| Error::CryptoFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + AES_256_GCM.tag_len());
    out.extend_from_slice(&nonce);

    let mut body = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::empty(),
        &mut body,
    )
    .map_err(|_| Error::CryptoFailed)?;

    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt one datagram sealed by [`seal`]. Fails on truncation, tampering,
/// or a key mismatch.
pub fn open(key_bytes: &[u8; KEY_LEN], datagram: &[u8]) -> Result<Vec<u8>, Error> {
    if datagram.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(Error::InvalidInput);
    }

    let key = key(key_bytes)?;
    let nonce = Nonce::try_assume_unique_for_key(&datagram[..NONCE_LEN])
        .map_err(|_| Error::CryptoFailed)?;

    let mut body = datagram[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut body)
        .map_err(|_| Error::CryptoFailed)?;

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_arbitrary_payloads() {
        let key = [42u8; KEY_LEN];

        for payload in [&b""[..], b"x", &[0u8; 1500]] {
            let sealed = seal(&key, payload).unwrap();
            assert_ne!(&sealed[NONCE_LEN..], payload);
            assert_eq!(open(&key, &sealed).unwrap(), payload);
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_LEN], b"datagram").unwrap();
        assert_eq!(
            open(&[2u8; KEY_LEN], &sealed).unwrap_err(),
            Error::CryptoFailed
        );
    }

    #[test]
    fn tampered_datagram_fails() {
        let key = [3u8; KEY_LEN];
        let mut sealed = seal(&key, b"datagram").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert_eq!(open(&key, &sealed).unwrap_err(), Error::CryptoFailed);
    }

    #[test]
    fn truncated_datagram_fails() {
        let key = [4u8; KEY_LEN];
        assert_eq!(open(&key, &[0u8; 8]).unwrap_err(), Error::InvalidInput);
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let key = [5u8; KEY_LEN];
        let a = seal(&key, b"datagram").unwrap();
        let b = seal(&key, b"datagram").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
