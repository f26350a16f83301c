use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{HandshakeError, Result};
use crate::suite::Cipher;
use crate::suite::CipherSuite;
use crate::types::{MacAddr, Nonce};

/// Group temporal key with its key index (1 or 2)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Gtk {
    key: Vec<u8>,
    pub index: u8,
    pub tx: bool,
}

impl Gtk {
    pub fn new(key: &[u8], index: u8, tx: bool) -> Self {
        Self {
            key: key.to_vec(),
            index,
            tx,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for Gtk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gtk")
            .field("index", &self.index)
            .field("tx", &self.tx)
            .field("len", &self.key.len())
            .finish()
    }
}

/// Integrity group temporal key (index 4 or 5) and its packet number
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Igtk {
    key: Vec<u8>,
    pub index: u16,
    /// 48-bit IGTK packet number
    pub ipn: u64,
}

impl Igtk {
    pub fn new(key: &[u8], index: u16, ipn: u64) -> Self {
        Self {
            key: key.to_vec(),
            index,
            ipn,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for Igtk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Igtk")
            .field("index", &self.index)
            .field("ipn", &self.ipn)
            .field("len", &self.key.len())
            .finish()
    }
}

fn expand(
    gmk: &[u8],
    label: &str,
    aa: MacAddr,
    gnonce: &Nonce,
    suite: &CipherSuite,
    cipher: Cipher,
) -> Result<Zeroizing<Vec<u8>>> {
    if gmk.len() < 16 {
        return Err(HandshakeError::Crypto("group master key too short".to_string()));
    }
    let mut context = Vec::with_capacity(6 + 32);
    context.extend_from_slice(aa.as_bytes());
    context.extend_from_slice(gnonce);
    suite.kdf().derive(gmk, label, &context, cipher.tk_len())
}

/// GTK = KDF(GMK, "Group key expansion", AA || GNonce)
pub fn derive_gtk(
    gmk: &[u8],
    aa: MacAddr,
    gnonce: &Nonce,
    suite: &CipherSuite,
) -> Result<Zeroizing<Vec<u8>>> {
    expand(gmk, "Group key expansion", aa, gnonce, suite, suite.group)
}

/// IGTK = KDF(GMK, "IGTK key expansion", AA || GNonce)
pub fn derive_igtk(
    gmk: &[u8],
    aa: MacAddr,
    gnonce: &Nonce,
    suite: &CipherSuite,
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = suite.group_mgmt.ok_or_else(|| {
        HandshakeError::UnsupportedSuite("no management group cipher negotiated".to_string())
    })?;
    expand(gmk, "IGTK key expansion", aa, gnonce, suite, cipher)
}
