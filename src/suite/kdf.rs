//! Pseudorandom functions used to expand a master key
//!
//! IEEE 802.11-2016 12.7.1.2 (PRF-SHA1) and 12.7.1.7.2 (KDF-Hash-Length).

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result};

pub type HmacSha1 = Hmac<Sha1>;
pub type HmacSha256 = Hmac<Sha256>;
pub type HmacSha384 = Hmac<Sha384>;

/// Key derivation function selected by the AKM
pub trait KeyDerivation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expand `key` into `len` bytes bound to `label` and `context`
    fn derive(
        &self,
        key: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// Run any keyed MAC over the concatenation of `parts`
pub(crate) fn mac_over<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| HandshakeError::Crypto(format!("MAC key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// PRF-n built on HMAC-SHA1 (legacy AKMs 1 and 2)
#[derive(Debug, Clone, Copy, Default)]
pub struct PrfSha1;

impl KeyDerivation for PrfSha1 {
    fn name(&self) -> &'static str {
        "PRF-SHA1"
    }

    fn derive(
        &self,
        key: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(len + 20));
        let mut counter: u8 = 0;
        while out.len() < len {
            let block = mac_over::<HmacSha1>(key, &[label.as_bytes(), &[0u8], context, &[counter]])?;
            out.extend_from_slice(&block);
            counter = counter
                .checked_add(1)
                .ok_or_else(|| HandshakeError::Crypto("PRF output too long".to_string()))?;
        }
        out.truncate(len);
        Ok(out)
    }
}

fn kdf_hash<M: Mac + KeyInit>(
    key: &[u8],
    label: &str,
    context: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let bits = u16::try_from(len * 8)
        .map_err(|_| HandshakeError::Crypto("KDF output too long".to_string()))?;
    let mut out = Zeroizing::new(Vec::with_capacity(len + 48));
    let mut counter: u16 = 1;
    while out.len() < len {
        let block = mac_over::<M>(
            key,
            &[&counter.to_le_bytes(), label.as_bytes(), context, &bits.to_le_bytes()],
        )?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

/// KDF-SHA256 (AKMs 5, 6, 8, 11)
#[derive(Debug, Clone, Copy, Default)]
pub struct KdfSha256;

impl KeyDerivation for KdfSha256 {
    fn name(&self) -> &'static str {
        "KDF-SHA256"
    }

    fn derive(
        &self,
        key: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        kdf_hash::<HmacSha256>(key, label, context, len)
    }
}

/// KDF-SHA384 (AKM 12)
#[derive(Debug, Clone, Copy, Default)]
pub struct KdfSha384;

impl KeyDerivation for KdfSha384 {
    fn name(&self) -> &'static str {
        "KDF-SHA384"
    }

    fn derive(
        &self,
        key: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        kdf_hash::<HmacSha384>(key, label, context, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_sha1_truncates_to_requested_length() {
        let out = PrfSha1.derive(b"key", "label", b"context", 48).unwrap();
        assert_eq!(out.len(), 48);
        let longer = PrfSha1.derive(b"key", "label", b"context", 64).unwrap();
        assert_eq!(&longer[..48], &out[..]);
    }

    #[test]
    fn test_kdf_length_is_bound_into_output() {
        // Unlike PRF-SHA1 the requested length is an input, so a shorter
        // output is not a prefix of a longer one.
        let short = KdfSha256.derive(b"key", "label", b"context", 32).unwrap();
        let long = KdfSha256.derive(b"key", "label", b"context", 64).unwrap();
        assert_ne!(&long[..32], &short[..]);
    }

    #[test]
    fn test_kdfs_are_deterministic_and_label_separated() {
        for kdf in [&KdfSha256 as &dyn KeyDerivation, &KdfSha384, &PrfSha1] {
            let a = kdf.derive(b"secret", "one", b"ctx", 40).unwrap();
            let b = kdf.derive(b"secret", "one", b"ctx", 40).unwrap();
            let c = kdf.derive(b"secret", "two", b"ctx", 40).unwrap();
            assert_eq!(a, b, "{}", kdf.name());
            assert_ne!(a, c, "{}", kdf.name());
        }
    }
}
