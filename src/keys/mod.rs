//! Key hierarchy: PMK, PTK, GTK/IGTK and key-data wrapping
//!
//! Secret material lives in zeroize-on-drop containers and never appears in
//! `Debug` output.

pub mod gtk;
pub mod ptk;
pub mod wrap;

use std::fmt;

use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{HandshakeError, Result};
use crate::suite::kdf::{mac_over, HmacSha1, HmacSha256, HmacSha384};
use crate::suite::{Akm, HashAlg};
use crate::types::{MacAddr, Pmkid};

pub use gtk::{derive_gtk, derive_igtk, Gtk, Igtk};
pub use ptk::{derive_ptk, Ptk};

/// Pairwise master key (32 bytes, or 48 for Suite B 192-bit)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pmk(Vec<u8>);

impl Pmk {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            32 | 48 => Ok(Pmk(bytes.to_vec())),
            n => Err(HandshakeError::Crypto(format!("PMK must be 32 or 48 bytes, got {}", n))),
        }
    }

    /// PSK derivation: PBKDF2-HMAC-SHA1(passphrase, ssid, 4096, 256 bits)
    pub fn from_passphrase(passphrase: &str, ssid: &[u8]) -> Result<Self> {
        if !(8..=63).contains(&passphrase.len()) || !passphrase.is_ascii() {
            return Err(HandshakeError::Crypto(
                "passphrase must be 8..63 ASCII characters".to_string(),
            ));
        }
        if ssid.is_empty() || ssid.len() > 32 {
            return Err(HandshakeError::Crypto("SSID must be 1..32 bytes".to_string()));
        }
        let mut out = vec![0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), ssid, 4096, &mut out);
        Ok(Pmk(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// PMKID = Truncate-128(HMAC-Hash(PMK, "PMK Name" || AA || SPA))
    pub fn pmkid(&self, aa: MacAddr, spa: MacAddr, akm: Akm) -> Result<Pmkid> {
        let parts: [&[u8]; 3] = [b"PMK Name", aa.as_bytes(), spa.as_bytes()];
        let full = match akm.hash() {
            HashAlg::Sha1 => mac_over::<HmacSha1>(&self.0, &parts)?,
            HashAlg::Sha256 => mac_over::<HmacSha256>(&self.0, &parts)?,
            HashAlg::Sha384 => mac_over::<HmacSha384>(&self.0, &parts)?,
        };
        let mut id = [0u8; 16];
        id.copy_from_slice(&full[..16]);
        Ok(Pmkid(id))
    }
}

impl PartialEq for Pmk {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && bool::from(self.0[..].ct_eq(&other.0[..]))
    }
}

impl Eq for Pmk {}

impl fmt::Debug for Pmk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pmk(<{} bytes redacted>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_known_answer() {
        // IEEE 802.11 J.4 test vector
        let pmk = Pmk::from_passphrase("password", b"IEEE").unwrap();
        assert_eq!(
            hex::encode(pmk.as_bytes()),
            "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12e"
        );
    }

    #[test]
    fn test_passphrase_bounds() {
        assert!(Pmk::from_passphrase("short", b"ssid").is_err());
        assert!(Pmk::from_passphrase(&"x".repeat(64), b"ssid").is_err());
        assert!(Pmk::from_passphrase("longenough", b"").is_err());
    }

    #[test]
    fn test_pmkid_depends_on_addresses() {
        let pmk = Pmk::new(&[7u8; 32]).unwrap();
        let aa = MacAddr([2, 0, 0, 0, 0, 1]);
        let spa = MacAddr([2, 0, 0, 0, 0, 2]);
        let a = pmk.pmkid(aa, spa, Akm::Psk).unwrap();
        let b = pmk.pmkid(spa, aa, Akm::Psk).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, pmk.pmkid(aa, spa, Akm::PskSha256).unwrap());
    }

    #[test]
    fn test_debug_is_redacted() {
        let pmk = Pmk::new(&[0xAB; 32]).unwrap();
        let shown = format!("{:?}", pmk);
        assert!(!shown.contains("ab"));
        assert!(!shown.contains("171"));
    }
}
