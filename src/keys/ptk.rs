use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{HandshakeError, Result};
use crate::keys::Pmk;
use crate::suite::{Cipher, CipherSuite};
use crate::types::{MacAddr, Nonce};

/// Pairwise transient key, split as KCK || KEK || TK
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Ptk {
    bytes: Vec<u8>,
    kck_len: usize,
    kek_len: usize,
    #[zeroize(skip)]
    cipher: Cipher,
}

impl Ptk {
    pub fn kck(&self) -> &[u8] {
        &self.bytes[..self.kck_len]
    }

    pub fn kek(&self) -> &[u8] {
        &self.bytes[self.kck_len..self.kck_len + self.kek_len]
    }

    pub fn tk(&self) -> &[u8] {
        &self.bytes[self.kck_len + self.kek_len..]
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }
}

impl fmt::Debug for Ptk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ptk")
            .field("kck_len", &self.kck_len)
            .field("kek_len", &self.kek_len)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

/// PTK = KDF(PMK, "Pairwise key expansion",
///           min(AA,SPA) || max(AA,SPA) || min(ANonce,SNonce) || max(ANonce,SNonce))
///
/// Addresses and nonces are ordered bytewise, so both sides get the same
/// PTK whichever of them passes its own values first.
pub fn derive_ptk(
    pmk: &Pmk,
    mac_a: MacAddr,
    mac_b: MacAddr,
    nonce_a: &Nonce,
    nonce_b: &Nonce,
    suite: &CipherSuite,
) -> Result<Ptk> {
    if pmk.len() != suite.akm.pmk_len() {
        return Err(HandshakeError::UnsupportedSuite(format!(
            "{} needs a {}-byte PMK, got {}",
            suite.akm,
            suite.akm.pmk_len(),
            pmk.len()
        )));
    }

    let mut context = Vec::with_capacity(6 * 2 + 32 * 2);
    context.extend_from_slice(mac_a.min(mac_b).as_bytes());
    context.extend_from_slice(mac_a.max(mac_b).as_bytes());
    context.extend_from_slice(nonce_a.min(nonce_b));
    context.extend_from_slice(nonce_a.max(nonce_b));

    let bytes = suite
        .kdf()
        .derive(pmk.as_bytes(), "Pairwise key expansion", &context, suite.ptk_len())?;

    Ok(Ptk {
        bytes: bytes.to_vec(),
        kck_len: suite.akm.kck_len(),
        kek_len: suite.akm.kek_len(),
        cipher: suite.pairwise,
    })
}
