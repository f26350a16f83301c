//! EAPOL-Key descriptor type and the Key Information field

use std::fmt;

use crate::error::HandshakeError;

/// Key descriptor type octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    /// IEEE 802.11 (RSN)
    Rsn = 2,
    /// Pre-RSN WPA
    Wpa = 254,
}

impl TryFrom<u8> for DescriptorType {
    type Error = HandshakeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(DescriptorType::Rsn),
            254 => Ok(DescriptorType::Wpa),
            other => Err(HandshakeError::MalformedFrame(format!(
                "unknown key descriptor type {}",
                other
            ))),
        }
    }
}

/// Key descriptor version (Key Information bits 0-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorVersion {
    /// MIC and key wrap defined by the AKM
    AkmDefined = 0,
    /// HMAC-MD5 MIC, RC4 key data
    HmacMd5Rc4 = 1,
    /// HMAC-SHA1-128 MIC, AES key wrap
    HmacSha1Aes = 2,
    /// AES-128-CMAC MIC, AES key wrap
    AesCmacAes = 3,
}

impl TryFrom<u8> for DescriptorVersion {
    type Error = HandshakeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DescriptorVersion::AkmDefined),
            1 => Ok(DescriptorVersion::HmacMd5Rc4),
            2 => Ok(DescriptorVersion::HmacSha1Aes),
            3 => Ok(DescriptorVersion::AesCmacAes),
            other => Err(HandshakeError::MalformedFrame(format!(
                "unknown key descriptor version {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Group,
    Pairwise,
}

/// Key Information field (big-endian u16 on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub version: DescriptorVersion,
    pub key_type: KeyType,
    /// WPA only: GTK index carried in group message 1
    pub key_index: u8,
    pub install: bool,
    pub ack: bool,
    pub mic: bool,
    pub secure: bool,
    pub error: bool,
    pub request: bool,
    pub encrypted_key_data: bool,
    pub smk_message: bool,
}

impl KeyInfo {
    pub fn new(version: DescriptorVersion, key_type: KeyType) -> Self {
        Self {
            version,
            key_type,
            key_index: 0,
            install: false,
            ack: false,
            mic: false,
            secure: false,
            error: false,
            request: false,
            encrypted_key_data: false,
            smk_message: false,
        }
    }

    pub fn to_u16(&self) -> u16 {
        let mut v = self.version as u16;
        if self.key_type == KeyType::Pairwise {
            v |= 1 << 3;
        }
        v |= ((self.key_index & 0x03) as u16) << 4;
        if self.install {
            v |= 1 << 6;
        }
        if self.ack {
            v |= 1 << 7;
        }
        if self.mic {
            v |= 1 << 8;
        }
        if self.secure {
            v |= 1 << 9;
        }
        if self.error {
            v |= 1 << 10;
        }
        if self.request {
            v |= 1 << 11;
        }
        if self.encrypted_key_data {
            v |= 1 << 12;
        }
        if self.smk_message {
            v |= 1 << 13;
        }
        v
    }
}

impl TryFrom<u16> for KeyInfo {
    type Error = HandshakeError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        if v & 0xc000 != 0 {
            return Err(HandshakeError::MalformedFrame(format!(
                "reserved key information bits set in 0x{:04x}",
                v
            )));
        }
        let bit = |n: u16| v & (1 << n) != 0;
        Ok(Self {
            version: DescriptorVersion::try_from((v & 0x07) as u8)?,
            key_type: if bit(3) { KeyType::Pairwise } else { KeyType::Group },
            key_index: ((v >> 4) & 0x03) as u8,
            install: bit(6),
            ack: bit(7),
            mic: bit(8),
            secure: bit(9),
            error: bit(10),
            request: bit(11),
            encrypted_key_data: bit(12),
            smk_message: bit(13),
        })
    }
}

impl fmt::Display for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x} [v{}", self.to_u16(), self.version as u8)?;
        let flags = [
            (self.key_type == KeyType::Pairwise, "P"),
            (self.install, "I"),
            (self.ack, "A"),
            (self.mic, "M"),
            (self.secure, "S"),
            (self.error, "E"),
            (self.request, "R"),
            (self.encrypted_key_data, "D"),
        ];
        for (set, name) in flags {
            if set {
                write!(f, " {}", name)?;
            }
        }
        write!(f, "]")
    }
}
