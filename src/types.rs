//! Small value types shared by every component

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 802.11 MAC address (EUI-48)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| anyhow::anyhow!("Invalid MAC address '{}': {}", s, e))?;
        let addr: [u8; 6] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("MAC address '{}' must be 6 bytes", s))?;
        Ok(MacAddr(addr))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(addr: MacAddr) -> Self {
        addr.to_string()
    }
}

/// 32-byte handshake nonce (ANonce / SNonce / GNonce)
pub type Nonce = [u8; 32];

/// 16-byte PMK identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pmkid(pub [u8; 16]);

impl fmt::Debug for Pmkid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pmkid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Pmkid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Cryptographically secure random source for nonces, GMKs, SAE scalars
/// and anti-clogging secrets
pub trait SecureRng: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> SecureRng for T {}

/// Which side of the link a role context or session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Access point side: sends message 1/3 and group message 1
    Authenticator,
    /// Station side: sends message 2/4 and group message 2
    Supplicant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Authenticator => write!(f, "authenticator"),
            Role::Supplicant => write!(f, "supplicant"),
        }
    }
}
