//! Key Data field: elements and KDEs
//!
//! A KDE is a vendor element `dd len 00-0f-ac type data`. Plain elements
//! (RSNE, RSNXE, the WPA vendor element) may sit alongside. Padding for
//! AES key wrap starts with `dd` followed by zeros.

use bytes::{Buf, BufMut};
use zeroize::Zeroizing;

use super::rsne::{RSNE_ID, RSNXE_ID, VENDOR_ID};
use crate::error::{HandshakeError, Result};
use crate::suite::{OUI_IEEE, OUI_WPA};
use crate::types::Pmkid;

pub const KDE_GTK: u8 = 1;
pub const KDE_PMKID: u8 = 4;
pub const KDE_IGTK: u8 = 9;

#[derive(Clone, PartialEq, Eq)]
pub struct GtkKde {
    pub key_id: u8,
    pub tx: bool,
    pub gtk: Zeroizing<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct IgtkKde {
    pub key_id: u16,
    pub ipn: u64,
    pub igtk: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for GtkKde {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GtkKde(id={}, tx={}, {} bytes)", self.key_id, self.tx, self.gtk.len())
    }
}

impl std::fmt::Debug for IgtkKde {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IgtkKde(id={}, ipn={}, {} bytes)", self.key_id, self.ipn, self.igtk.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDataElement {
    /// Complete RSN element, id and length included
    Rsne(Vec<u8>),
    /// Complete WPA vendor element
    WpaIe(Vec<u8>),
    /// Complete RSNX element
    Rsnxe(Vec<u8>),
    Gtk(GtkKde),
    Igtk(IgtkKde),
    Pmkid(Pmkid),
    Other { id: u8, body: Vec<u8> },
}

/// Parsed Key Data field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyData {
    pub elements: Vec<KeyDataElement>,
}

impl KeyData {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut elements = Vec::new();
        let mut buf = data;
        while buf.has_remaining() {
            let id = buf[0];
            if id == VENDOR_ID && (buf.len() == 1 || buf[1] == 0) {
                // Padding: everything after it must be zero
                if buf[1..].iter().any(|b| *b != 0) {
                    return Err(HandshakeError::MalformedFrame("non-zero key data padding".to_string()));
                }
                break;
            }
            if buf.len() < 2 || buf.len() < 2 + buf[1] as usize {
                return Err(HandshakeError::MalformedFrame("truncated key data element".to_string()));
            }
            let len = buf[1] as usize;
            let element = &buf[..2 + len];
            let body = &buf[2..2 + len];

            let parsed = match id {
                RSNE_ID => KeyDataElement::Rsne(element.to_vec()),
                RSNXE_ID => KeyDataElement::Rsnxe(element.to_vec()),
                VENDOR_ID if len >= 4 && body[..3] == OUI_WPA && body[3] == 1 => {
                    KeyDataElement::WpaIe(element.to_vec())
                }
                VENDOR_ID if len >= 4 && body[..3] == OUI_IEEE => parse_kde(body[3], &body[4..])?,
                other => KeyDataElement::Other {
                    id: other,
                    body: body.to_vec(),
                },
            };
            elements.push(parsed);
            buf.advance(2 + len);
        }
        Ok(Self { elements })
    }

    pub fn rsne(&self) -> Option<&[u8]> {
        self.elements.iter().find_map(|e| match e {
            KeyDataElement::Rsne(ie) | KeyDataElement::WpaIe(ie) => Some(ie.as_slice()),
            _ => None,
        })
    }

    /// Second RSNE in message 3 (WPA3 transition / optional pairwise)
    pub fn second_rsne(&self) -> Option<&[u8]> {
        self.elements
            .iter()
            .filter_map(|e| match e {
                KeyDataElement::Rsne(ie) => Some(ie.as_slice()),
                _ => None,
            })
            .nth(1)
    }

    pub fn rsnxe(&self) -> Option<&[u8]> {
        self.elements.iter().find_map(|e| match e {
            KeyDataElement::Rsnxe(ie) => Some(ie.as_slice()),
            _ => None,
        })
    }

    pub fn gtk(&self) -> Option<&GtkKde> {
        self.elements.iter().find_map(|e| match e {
            KeyDataElement::Gtk(g) => Some(g),
            _ => None,
        })
    }

    pub fn igtk(&self) -> Option<&IgtkKde> {
        self.elements.iter().find_map(|e| match e {
            KeyDataElement::Igtk(g) => Some(g),
            _ => None,
        })
    }

    pub fn pmkid(&self) -> Option<Pmkid> {
        self.elements.iter().find_map(|e| match e {
            KeyDataElement::Pmkid(p) => Some(*p),
            _ => None,
        })
    }
}

fn parse_kde(kde_type: u8, data: &[u8]) -> Result<KeyDataElement> {
    match kde_type {
        KDE_GTK => {
            if data.len() < 2 + 5 {
                return Err(HandshakeError::MalformedFrame("short GTK KDE".to_string()));
            }
            if data[0] & 0x03 == 0 {
                return Err(HandshakeError::MalformedFrame("GTK KDE with key id 0".to_string()));
            }
            Ok(KeyDataElement::Gtk(GtkKde {
                key_id: data[0] & 0x03,
                tx: data[0] & 0x04 != 0,
                gtk: Zeroizing::new(data[2..].to_vec()),
            }))
        }
        KDE_PMKID => {
            let id: [u8; 16] = data
                .try_into()
                .map_err(|_| HandshakeError::MalformedFrame("PMKID KDE must be 16 bytes".to_string()))?;
            Ok(KeyDataElement::Pmkid(Pmkid(id)))
        }
        KDE_IGTK => {
            if data.len() < 8 + 16 {
                return Err(HandshakeError::MalformedFrame("short IGTK KDE".to_string()));
            }
            let mut buf = data;
            let key_id = buf.get_u16_le();
            let ipn = buf.get_uint_le(6);
            Ok(KeyDataElement::Igtk(IgtkKde {
                key_id,
                ipn,
                igtk: Zeroizing::new(buf.to_vec()),
            }))
        }
        other => Ok(KeyDataElement::Other {
            id: VENDOR_ID,
            body: [&OUI_IEEE[..], &[other], data].concat(),
        }),
    }
}

/// Builds a Key Data field in zeroizing storage
#[derive(Default)]
pub struct KeyDataBuilder {
    buf: Zeroizing<Vec<u8>>,
}

impl KeyDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a complete element (id and length included)
    pub fn element(mut self, element: &[u8]) -> Self {
        self.buf.extend_from_slice(element);
        self
    }

    fn kde(mut self, kde_type: u8, data: &[&[u8]]) -> Self {
        let len: usize = 4 + data.iter().map(|d| d.len()).sum::<usize>();
        self.buf.put_u8(VENDOR_ID);
        self.buf.put_u8(len as u8);
        self.buf.put_slice(&OUI_IEEE);
        self.buf.put_u8(kde_type);
        for d in data {
            self.buf.put_slice(d);
        }
        self
    }

    pub fn gtk(self, key_id: u8, tx: bool, gtk: &[u8]) -> Self {
        let flags = (key_id & 0x03) | if tx { 0x04 } else { 0 };
        self.kde(KDE_GTK, &[&[flags, 0], gtk])
    }

    pub fn igtk(self, key_id: u16, ipn: u64, igtk: &[u8]) -> Self {
        let ipn_bytes = ipn.to_le_bytes();
        self.kde(KDE_IGTK, &[&key_id.to_le_bytes(), &ipn_bytes[..6], igtk])
    }

    pub fn pmkid(self, pmkid: &Pmkid) -> Self {
        self.kde(KDE_PMKID, &[&pmkid.0])
    }

    pub fn finish(self) -> Zeroizing<Vec<u8>> {
        self.buf
    }
}

/// Pad key data for AES key wrap: `dd` then zeros, to a multiple of 8
/// and at least 16 bytes
pub fn pad_for_wrap(data: &mut Vec<u8>) {
    if data.len() % 8 != 0 || data.len() < 16 {
        data.push(VENDOR_ID);
        while data.len() % 8 != 0 || data.len() < 16 {
            data.push(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eapol::rsne::encode_rsnxe;

    #[test]
    fn test_message3_key_data_layout() {
        let rsne = hex::decode("30140100000fac040100000fac040100000fac020000").unwrap();
        let gtk = [0x77u8; 16];
        let mut data = KeyDataBuilder::new()
            .element(&rsne)
            .gtk(1, true, &gtk)
            .igtk(4, 0x0000_0102_0304, &[0x88u8; 16])
            .element(&encode_rsnxe(true))
            .finish()
            .to_vec();
        pad_for_wrap(&mut data);
        assert_eq!(data.len() % 8, 0);

        let parsed = KeyData::parse(&data).unwrap();
        assert_eq!(parsed.rsne(), Some(rsne.as_slice()));
        let g = parsed.gtk().unwrap();
        assert_eq!(g.key_id, 1);
        assert!(g.tx);
        assert_eq!(&g.gtk[..], &gtk[..]);
        let ig = parsed.igtk().unwrap();
        assert_eq!(ig.key_id, 4);
        assert_eq!(ig.ipn, 0x0102_0304);
        assert!(parsed.rsnxe().is_some());
    }

    #[test]
    fn test_gtk_kde_with_key_id_zero_is_refused() {
        let data = KeyDataBuilder::new().gtk(0, true, &[0x77u8; 16]).finish();
        assert!(matches!(
            KeyData::parse(&data),
            Err(HandshakeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_pmkid_kde() {
        let data = KeyDataBuilder::new().pmkid(&Pmkid([0x3c; 16])).finish();
        assert_eq!(data.len(), 22);
        assert_eq!(KeyData::parse(&data).unwrap().pmkid(), Some(Pmkid([0x3c; 16])));
    }

    #[test]
    fn test_padding_rules() {
        let mut short = vec![1u8, 2, 3];
        pad_for_wrap(&mut short);
        assert_eq!(short.len(), 16);
        assert_eq!(short[3], 0xdd);

        let mut aligned = vec![0x30u8; 24];
        pad_for_wrap(&mut aligned);
        assert_eq!(aligned.len(), 24);
    }

    #[test]
    fn test_truncated_element_rejected() {
        assert!(KeyData::parse(&[0x30, 0x10, 0x01]).is_err());
        assert!(KeyData::parse(&[0xdd, 0x00, 0x00, 0x01]).is_err());
    }
}
