//! RSN element (id 48), legacy WPA vendor element and RSNXE
//!
//! Counts, version and capabilities are little-endian, as in every 802.11
//! management element.

use bytes::{Buf, BufMut};

use crate::error::{HandshakeError, Result};
use crate::suite::{Akm, Cipher, OUI_IEEE, OUI_WPA};
use crate::types::Pmkid;

pub const RSNE_ID: u8 = 48;
pub const RSNXE_ID: u8 = 244;
pub const VENDOR_ID: u8 = 0xdd;

/// RSNXE capability bit: SAE hash-to-element supported
pub const RSNXE_SAE_H2E: u8 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuiteSelector {
    pub oui: [u8; 3],
    pub suite_type: u8,
}

impl SuiteSelector {
    pub fn cipher(cipher: Cipher, wpa: bool) -> Self {
        Self {
            oui: if wpa { OUI_WPA } else { OUI_IEEE },
            suite_type: cipher.suite_type(),
        }
    }

    pub fn akm(akm: Akm, wpa: bool) -> Self {
        Self {
            oui: if wpa { OUI_WPA } else { OUI_IEEE },
            suite_type: akm.suite_type(),
        }
    }

    fn known(&self) -> bool {
        self.oui == OUI_IEEE || self.oui == OUI_WPA
    }

    fn as_cipher(&self) -> Option<Cipher> {
        self.known().then(|| Cipher::from_suite_type(self.suite_type)).flatten()
    }

    fn as_akm(&self) -> Option<Akm> {
        self.known().then(|| Akm::from_suite_type(self.suite_type)).flatten()
    }

    fn read(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(HandshakeError::MalformedFrame("truncated suite selector".to_string()));
        }
        let mut oui = [0u8; 3];
        buf.copy_to_slice(&mut oui);
        Ok(Self {
            oui,
            suite_type: buf.get_u8(),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_slice(&self.oui);
        out.put_u8(self.suite_type);
    }
}

/// RSN Capabilities field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RsnCapabilities(pub u16);

impl RsnCapabilities {
    const MFPR: u16 = 1 << 6;
    const MFPC: u16 = 1 << 7;

    pub fn mfpr(&self) -> bool {
        self.0 & Self::MFPR != 0
    }

    pub fn mfpc(&self) -> bool {
        self.0 & Self::MFPC != 0
    }

    pub fn with_mfpr(self, on: bool) -> Self {
        Self(if on { self.0 | Self::MFPR } else { self.0 & !Self::MFPR })
    }

    pub fn with_mfpc(self, on: bool) -> Self {
        Self(if on { self.0 | Self::MFPC } else { self.0 & !Self::MFPC })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IeKind {
    Rsn,
    Wpa,
}

/// Parsed RSN or WPA element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rsne {
    pub kind: IeKind,
    pub version: u16,
    pub group_data_cipher: Option<SuiteSelector>,
    pub pairwise_ciphers: Vec<SuiteSelector>,
    pub akm_suites: Vec<SuiteSelector>,
    pub capabilities: Option<RsnCapabilities>,
    pub pmkids: Vec<Pmkid>,
    pub group_mgmt_cipher: Option<SuiteSelector>,
}

impl Rsne {
    /// RSN element with IEEE selectors
    pub fn build(
        akms: &[Akm],
        pairwise: &[Cipher],
        group: Cipher,
        capabilities: Option<RsnCapabilities>,
        group_mgmt: Option<Cipher>,
    ) -> Self {
        Self {
            kind: IeKind::Rsn,
            version: 1,
            group_data_cipher: Some(SuiteSelector::cipher(group, false)),
            pairwise_ciphers: pairwise.iter().map(|c| SuiteSelector::cipher(*c, false)).collect(),
            akm_suites: akms.iter().map(|a| SuiteSelector::akm(*a, false)).collect(),
            capabilities,
            pmkids: Vec::new(),
            group_mgmt_cipher: group_mgmt.map(|c| SuiteSelector::cipher(c, false)),
        }
    }

    /// Legacy WPA vendor element
    pub fn build_wpa(akms: &[Akm], pairwise: &[Cipher], group: Cipher) -> Self {
        Self {
            kind: IeKind::Wpa,
            version: 1,
            group_data_cipher: Some(SuiteSelector::cipher(group, true)),
            pairwise_ciphers: pairwise.iter().map(|c| SuiteSelector::cipher(*c, true)).collect(),
            akm_suites: akms.iter().map(|a| SuiteSelector::akm(*a, true)).collect(),
            capabilities: None,
            pmkids: Vec::new(),
            group_mgmt_cipher: None,
        }
    }

    pub fn with_pmkid(mut self, pmkid: Pmkid) -> Self {
        self.pmkids = vec![pmkid];
        self
    }

    pub fn is_wpa(&self) -> bool {
        self.kind == IeKind::Wpa
    }

    pub fn akms(&self) -> Vec<Akm> {
        self.akm_suites.iter().filter_map(|s| s.as_akm()).collect()
    }

    pub fn pairwise_ciphers(&self) -> Vec<Cipher> {
        self.pairwise_ciphers.iter().filter_map(|s| s.as_cipher()).collect()
    }

    pub fn group_cipher(&self) -> Option<Cipher> {
        self.group_data_cipher.and_then(|s| s.as_cipher())
    }

    pub fn group_mgmt(&self) -> Option<Cipher> {
        self.group_mgmt_cipher.and_then(|s| s.as_cipher())
    }

    /// Parse a complete element including its id and length octets
    pub fn parse(element: &[u8]) -> Result<Self> {
        if element.len() < 2 || element.len() != 2 + element[1] as usize {
            return Err(HandshakeError::MalformedFrame("bad element length".to_string()));
        }
        let mut buf = &element[2..];
        let kind = match element[0] {
            RSNE_ID => IeKind::Rsn,
            VENDOR_ID if buf.len() >= 4 && buf[..3] == OUI_WPA && buf[3] == 1 => {
                buf.advance(4);
                IeKind::Wpa
            }
            other => {
                return Err(HandshakeError::MalformedFrame(format!(
                    "element {} is not an RSN or WPA element",
                    other
                )))
            }
        };

        if buf.remaining() < 2 {
            return Err(HandshakeError::MalformedFrame("missing element version".to_string()));
        }
        let version = buf.get_u16_le();
        if version != 1 {
            return Err(HandshakeError::MalformedFrame(format!(
                "unsupported element version {}",
                version
            )));
        }

        let mut ie = Self {
            kind,
            version,
            group_data_cipher: None,
            pairwise_ciphers: Vec::new(),
            akm_suites: Vec::new(),
            capabilities: None,
            pmkids: Vec::new(),
            group_mgmt_cipher: None,
        };

        // Every field after the version is optional once the element ends.
        if !buf.has_remaining() {
            return Ok(ie);
        }
        ie.group_data_cipher = Some(SuiteSelector::read(&mut buf)?);
        if !buf.has_remaining() {
            return Ok(ie);
        }
        ie.pairwise_ciphers = read_selector_list(&mut buf)?;
        if !buf.has_remaining() {
            return Ok(ie);
        }
        ie.akm_suites = read_selector_list(&mut buf)?;
        if !buf.has_remaining() || kind == IeKind::Wpa {
            return Ok(ie);
        }
        if buf.remaining() < 2 {
            return Err(HandshakeError::MalformedFrame("truncated RSN capabilities".to_string()));
        }
        ie.capabilities = Some(RsnCapabilities(buf.get_u16_le()));
        if !buf.has_remaining() {
            return Ok(ie);
        }
        if buf.remaining() < 2 {
            return Err(HandshakeError::MalformedFrame("truncated PMKID count".to_string()));
        }
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < count * 16 {
            return Err(HandshakeError::MalformedFrame("truncated PMKID list".to_string()));
        }
        for _ in 0..count {
            let mut id = [0u8; 16];
            buf.copy_to_slice(&mut id);
            ie.pmkids.push(Pmkid(id));
        }
        if !buf.has_remaining() {
            return Ok(ie);
        }
        ie.group_mgmt_cipher = Some(SuiteSelector::read(&mut buf)?);
        Ok(ie)
    }

    /// Encode the complete element including id and length
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        if self.kind == IeKind::Wpa {
            body.put_slice(&OUI_WPA);
            body.put_u8(1);
        }
        body.put_u16_le(self.version);
        if let Some(group) = &self.group_data_cipher {
            group.write(&mut body);
            body.put_u16_le(self.pairwise_ciphers.len() as u16);
            for s in &self.pairwise_ciphers {
                s.write(&mut body);
            }
            body.put_u16_le(self.akm_suites.len() as u16);
            for s in &self.akm_suites {
                s.write(&mut body);
            }
        }
        if self.kind == IeKind::Rsn {
            let trailing = !self.pmkids.is_empty() || self.group_mgmt_cipher.is_some();
            if self.capabilities.is_some() || trailing {
                body.put_u16_le(self.capabilities.unwrap_or_default().0);
            }
            if trailing {
                body.put_u16_le(self.pmkids.len() as u16);
                for id in &self.pmkids {
                    body.put_slice(&id.0);
                }
            }
            if let Some(mgmt) = &self.group_mgmt_cipher {
                mgmt.write(&mut body);
            }
        }

        let mut out = Vec::with_capacity(body.len() + 2);
        out.put_u8(match self.kind {
            IeKind::Rsn => RSNE_ID,
            IeKind::Wpa => VENDOR_ID,
        });
        out.put_u8(body.len() as u8);
        out.extend_from_slice(&body);
        out
    }
}

fn read_selector_list(buf: &mut &[u8]) -> Result<Vec<SuiteSelector>> {
    if buf.remaining() < 2 {
        return Err(HandshakeError::MalformedFrame("truncated suite count".to_string()));
    }
    let count = buf.get_u16_le() as usize;
    if count == 0 || buf.remaining() < count * 4 {
        return Err(HandshakeError::MalformedFrame("bad suite list".to_string()));
    }
    (0..count).map(|_| SuiteSelector::read(buf)).collect()
}

/// RSN Extension element carrying the H2E capability bit
pub fn encode_rsnxe(h2e: bool) -> Vec<u8> {
    vec![RSNXE_ID, 1, if h2e { RSNXE_SAE_H2E } else { 0 }]
}

/// Whether an RSNXE (id, length, body) advertises SAE H2E
pub fn rsnxe_h2e(element: &[u8]) -> bool {
    element.len() >= 3 && element[0] == RSNXE_ID && element[2] & RSNXE_SAE_H2E != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_wpa2_psk_element() {
        // RSN, CCMP group, 1 x CCMP pairwise, 1 x PSK, caps 0
        let raw = hex::decode("30140100000fac040100000fac040100000fac020000").unwrap();
        let ie = Rsne::parse(&raw).unwrap();
        assert_eq!(ie.kind, IeKind::Rsn);
        assert_eq!(ie.group_cipher(), Some(Cipher::Ccmp128));
        assert_eq!(ie.pairwise_ciphers(), vec![Cipher::Ccmp128]);
        assert_eq!(ie.akms(), vec![Akm::Psk]);
        assert_eq!(ie.capabilities, Some(RsnCapabilities(0)));
        assert_eq!(ie.encode(), raw);
    }

    #[test]
    fn test_sae_element_with_pmkid_and_mgmt_cipher() {
        let caps = RsnCapabilities::default().with_mfpc(true).with_mfpr(true);
        let ie = Rsne::build(
            &[Akm::Sae],
            &[Cipher::Ccmp128],
            Cipher::Ccmp128,
            Some(caps),
            Some(Cipher::BipCmac128),
        )
        .with_pmkid(Pmkid([0x5a; 16]));
        let parsed = Rsne::parse(&ie.encode()).unwrap();
        assert_eq!(parsed, ie);
        assert!(parsed.capabilities.unwrap().mfpr());
        assert_eq!(parsed.group_mgmt(), Some(Cipher::BipCmac128));
    }

    #[test]
    fn test_wpa_vendor_element() {
        let ie = Rsne::build_wpa(&[Akm::Psk], &[Cipher::Tkip], Cipher::Tkip);
        let raw = ie.encode();
        assert_eq!(&raw[..6], &[0xdd, 0x16, 0x00, 0x50, 0xf2, 0x01]);
        let parsed = Rsne::parse(&raw).unwrap();
        assert!(parsed.is_wpa());
        assert_eq!(parsed.akms(), vec![Akm::Psk]);
        assert_eq!(parsed.pairwise_ciphers(), vec![Cipher::Tkip]);
    }

    #[test]
    fn test_truncated_elements_rejected() {
        let raw = hex::decode("30140100000fac040100000fac040100000fac020000").unwrap();
        assert!(Rsne::parse(&raw[..raw.len() - 1]).is_err());
        // Length octet claims more than the suite list provides
        let bad = hex::decode("300a0100000fac040200000fac04").unwrap();
        assert!(Rsne::parse(&bad).is_err());
    }

    #[test]
    fn test_rsnxe_h2e_bit() {
        assert!(rsnxe_h2e(&encode_rsnxe(true)));
        assert!(!rsnxe_h2e(&encode_rsnxe(false)));
    }
}
