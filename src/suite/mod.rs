//! Negotiated security suites
//!
//! An AKM + pairwise cipher pair selects one key-derivation function, one MIC
//! algorithm and one key-data cipher. They are chosen once per session by
//! [`CipherSuite::negotiate`] and held for the session's lifetime.

pub mod kdf;
pub mod mic;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::eapol::key_info::{DescriptorType, DescriptorVersion};
use crate::eapol::rsne::{Rsne, SuiteSelector};
use crate::error::{HandshakeError, Result};
use crate::keys::wrap::KeyWrap;
use kdf::{KdfSha256, KdfSha384, KeyDerivation, PrfSha1};
use mic::{AesCmacMic, HmacMd5Mic, HmacSha1Mic, HmacSha256Mic, HmacSha384Mic, MicAlgorithm};

/// IEEE 802.11 suite selector OUI (00-0F-AC)
pub const OUI_IEEE: [u8; 3] = [0x00, 0x0F, 0xAC];
/// Legacy WPA suite selector OUI (00-50-F2)
pub const OUI_WPA: [u8; 3] = [0x00, 0x50, 0xF2];

/// Hash function family behind an AKM's KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
}

/// Authentication and key management suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Akm {
    /// 802.1X with PRF-SHA1
    Ieee8021x,
    /// Pre-shared key with PRF-SHA1
    Psk,
    /// 802.1X with KDF-SHA256
    Ieee8021xSha256,
    /// Pre-shared key with KDF-SHA256
    PskSha256,
    /// Simultaneous Authentication of Equals (WPA3-Personal)
    Sae,
    /// Suite B (SHA-256)
    SuiteB,
    /// Suite B 192-bit (SHA-384)
    SuiteB192,
}

impl Akm {
    pub fn suite_type(self) -> u8 {
        match self {
            Akm::Ieee8021x => 1,
            Akm::Psk => 2,
            Akm::Ieee8021xSha256 => 5,
            Akm::PskSha256 => 6,
            Akm::Sae => 8,
            Akm::SuiteB => 11,
            Akm::SuiteB192 => 12,
        }
    }

    pub fn from_suite_type(suite_type: u8) -> Option<Akm> {
        match suite_type {
            1 => Some(Akm::Ieee8021x),
            2 => Some(Akm::Psk),
            5 => Some(Akm::Ieee8021xSha256),
            6 => Some(Akm::PskSha256),
            8 => Some(Akm::Sae),
            11 => Some(Akm::SuiteB),
            12 => Some(Akm::SuiteB192),
            _ => None,
        }
    }

    pub fn hash(self) -> HashAlg {
        match self {
            Akm::Ieee8021x | Akm::Psk => HashAlg::Sha1,
            Akm::Ieee8021xSha256 | Akm::PskSha256 | Akm::Sae | Akm::SuiteB => HashAlg::Sha256,
            Akm::SuiteB192 => HashAlg::Sha384,
        }
    }

    pub fn kck_len(self) -> usize {
        match self {
            Akm::SuiteB192 => 24,
            _ => 16,
        }
    }

    pub fn kek_len(self) -> usize {
        match self {
            Akm::SuiteB192 => 32,
            _ => 16,
        }
    }

    pub fn mic_len(self) -> usize {
        match self {
            Akm::SuiteB192 => 24,
            _ => 16,
        }
    }

    pub fn pmk_len(self) -> usize {
        match self {
            Akm::SuiteB192 => 48,
            _ => 32,
        }
    }

    pub fn is_psk(self) -> bool {
        matches!(self, Akm::Psk | Akm::PskSha256)
    }

    pub fn is_sae(self) -> bool {
        self == Akm::Sae
    }
}

impl fmt::Display for Akm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Akm::Ieee8021x => "802.1X",
            Akm::Psk => "PSK",
            Akm::Ieee8021xSha256 => "802.1X-SHA256",
            Akm::PskSha256 => "PSK-SHA256",
            Akm::Sae => "SAE",
            Akm::SuiteB => "802.1X-SuiteB",
            Akm::SuiteB192 => "802.1X-SuiteB-192",
        };
        write!(f, "{}", name)
    }
}

/// Data and management-frame cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cipher {
    Tkip,
    Ccmp128,
    BipCmac128,
    Gcmp128,
    Gcmp256,
    Ccmp256,
    BipGmac128,
    BipGmac256,
    BipCmac256,
}

impl Cipher {
    pub fn suite_type(self) -> u8 {
        match self {
            Cipher::Tkip => 2,
            Cipher::Ccmp128 => 4,
            Cipher::BipCmac128 => 6,
            Cipher::Gcmp128 => 8,
            Cipher::Gcmp256 => 9,
            Cipher::Ccmp256 => 10,
            Cipher::BipGmac128 => 11,
            Cipher::BipGmac256 => 12,
            Cipher::BipCmac256 => 13,
        }
    }

    pub fn from_suite_type(suite_type: u8) -> Option<Cipher> {
        match suite_type {
            2 => Some(Cipher::Tkip),
            4 => Some(Cipher::Ccmp128),
            6 => Some(Cipher::BipCmac128),
            8 => Some(Cipher::Gcmp128),
            9 => Some(Cipher::Gcmp256),
            10 => Some(Cipher::Ccmp256),
            11 => Some(Cipher::BipGmac128),
            12 => Some(Cipher::BipGmac256),
            13 => Some(Cipher::BipCmac256),
            _ => None,
        }
    }

    /// Temporal key length in bytes. TKIP carries its two Michael keys too.
    pub fn tk_len(self) -> usize {
        match self {
            Cipher::Tkip => 32,
            Cipher::Ccmp128 | Cipher::Gcmp128 | Cipher::BipCmac128 | Cipher::BipGmac128 => 16,
            Cipher::Gcmp256 | Cipher::Ccmp256 | Cipher::BipGmac256 | Cipher::BipCmac256 => 32,
        }
    }

    pub fn is_group_mgmt(self) -> bool {
        matches!(
            self,
            Cipher::BipCmac128 | Cipher::BipGmac128 | Cipher::BipGmac256 | Cipher::BipCmac256
        )
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Management frame protection (802.11w) setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pmf {
    #[default]
    Disabled,
    Optional,
    Required,
}

/// Runtime security policy of a role
///
/// One value names the whole WPA/WPA2/WPA3 variant; every code path is
/// compiled in and selected from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityPolicy {
    /// Original WPA (vendor IE, TKIP). Needs `legacy_wpa`.
    WpaPsk,
    Wpa2Psk,
    Wpa2PskSha256,
    Wpa3Sae,
    /// SAE and PSK side by side on one BSS
    Wpa3Transition,
    Wpa2Enterprise,
    Wpa3Enterprise192,
}

impl SecurityPolicy {
    /// AKMs in order of preference
    pub fn akms(self) -> &'static [Akm] {
        match self {
            SecurityPolicy::WpaPsk | SecurityPolicy::Wpa2Psk => &[Akm::Psk],
            SecurityPolicy::Wpa2PskSha256 => &[Akm::PskSha256, Akm::Psk],
            SecurityPolicy::Wpa3Sae => &[Akm::Sae],
            SecurityPolicy::Wpa3Transition => &[Akm::Sae, Akm::Psk],
            SecurityPolicy::Wpa2Enterprise => &[Akm::Ieee8021xSha256, Akm::Ieee8021x],
            SecurityPolicy::Wpa3Enterprise192 => &[Akm::SuiteB192],
        }
    }

    pub fn is_legacy_wpa(self) -> bool {
        self == SecurityPolicy::WpaPsk
    }

    pub fn uses_sae(self) -> bool {
        self.akms().contains(&Akm::Sae)
    }

    pub fn uses_passphrase(self) -> bool {
        self.akms().iter().any(|a| a.is_psk() || a.is_sae())
    }

    /// Effective PMF setting: WPA3-only policies force it on
    pub fn pmf(self, configured: Pmf) -> Pmf {
        match self {
            SecurityPolicy::Wpa3Sae | SecurityPolicy::Wpa3Enterprise192 => Pmf::Required,
            SecurityPolicy::Wpa3Transition if configured == Pmf::Disabled => Pmf::Optional,
            SecurityPolicy::WpaPsk => Pmf::Disabled,
            _ => configured,
        }
    }

    /// First of our AKMs that the peer also offers
    pub fn select_akm(self, offered: &[Akm]) -> Option<Akm> {
        self.akms().iter().copied().find(|a| offered.contains(a))
    }
}

/// Capability set selected for one session
#[derive(Clone)]
pub struct CipherSuite {
    pub akm: Akm,
    pub pairwise: Cipher,
    pub group: Cipher,
    pub group_mgmt: Option<Cipher>,
    pub descriptor: DescriptorType,
    pub version: DescriptorVersion,
    kdf: Arc<dyn KeyDerivation>,
    mic: Arc<dyn MicAlgorithm>,
    key_wrap: KeyWrap,
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("akm", &self.akm)
            .field("pairwise", &self.pairwise)
            .field("group", &self.group)
            .field("group_mgmt", &self.group_mgmt)
            .field("descriptor", &self.descriptor)
            .field("version", &self.version)
            .field("kdf", &self.kdf.name())
            .field("mic", &self.mic.name())
            .field("key_wrap", &self.key_wrap)
            .finish()
    }
}

impl CipherSuite {
    /// Build the capability set for an AKM/cipher combination
    ///
    /// `legacy_allowed` gates TKIP and the RC4 key-data cipher.
    pub fn new(
        akm: Akm,
        pairwise: Cipher,
        group: Cipher,
        group_mgmt: Option<Cipher>,
        descriptor: DescriptorType,
        legacy_allowed: bool,
    ) -> Result<Self> {
        if pairwise.is_group_mgmt() {
            return Err(HandshakeError::UnsupportedSuite(format!(
                "{} is not a pairwise cipher",
                pairwise
            )));
        }
        if (pairwise == Cipher::Tkip || descriptor == DescriptorType::Wpa) && !legacy_allowed {
            return Err(HandshakeError::UnsupportedSuite(
                "legacy WPA/TKIP is disabled".to_string(),
            ));
        }
        if descriptor == DescriptorType::Wpa && !akm.is_psk() && akm != Akm::Ieee8021x {
            return Err(HandshakeError::UnsupportedSuite(format!(
                "{} cannot run over the WPA descriptor",
                akm
            )));
        }
        if let Some(mgmt) = group_mgmt {
            if !mgmt.is_group_mgmt() {
                return Err(HandshakeError::UnsupportedSuite(format!(
                    "{} is not a management group cipher",
                    mgmt
                )));
            }
        }

        let version = match akm {
            Akm::Ieee8021x | Akm::Psk if pairwise == Cipher::Tkip => DescriptorVersion::HmacMd5Rc4,
            Akm::Ieee8021x | Akm::Psk => DescriptorVersion::HmacSha1Aes,
            Akm::Ieee8021xSha256 | Akm::PskSha256 => DescriptorVersion::AesCmacAes,
            Akm::Sae | Akm::SuiteB | Akm::SuiteB192 => DescriptorVersion::AkmDefined,
        };

        let kdf: Arc<dyn KeyDerivation> = match akm.hash() {
            HashAlg::Sha1 => Arc::new(PrfSha1),
            HashAlg::Sha256 => Arc::new(KdfSha256),
            HashAlg::Sha384 => Arc::new(KdfSha384),
        };

        let mic: Arc<dyn MicAlgorithm> = match (version, akm) {
            (DescriptorVersion::HmacMd5Rc4, _) => Arc::new(HmacMd5Mic),
            (DescriptorVersion::HmacSha1Aes, _) => Arc::new(HmacSha1Mic),
            (DescriptorVersion::AesCmacAes, _) | (_, Akm::Sae) => Arc::new(AesCmacMic),
            (_, Akm::SuiteB192) => Arc::new(HmacSha384Mic),
            _ => Arc::new(HmacSha256Mic),
        };

        let key_wrap = match version {
            DescriptorVersion::HmacMd5Rc4 => KeyWrap::Rc4,
            _ => KeyWrap::AesKw,
        };

        Ok(Self {
            akm,
            pairwise,
            group,
            group_mgmt,
            descriptor,
            version,
            kdf,
            mic,
            key_wrap,
        })
    }

    /// Pick the session suite from our own IE and the peer's IE
    ///
    /// The peer's IE is the station's association-request RSNE (on the
    /// authenticator) or the AP's beacon RSNE (on the supplicant). The AKM is
    /// the first of our policy's AKMs that both sides offer; the pairwise
    /// cipher the first of ours the peer also lists.
    pub fn negotiate(
        policy: SecurityPolicy,
        own: &Rsne,
        peer: &Rsne,
        legacy_allowed: bool,
    ) -> Result<Self> {
        if own.kind != peer.kind {
            return Err(HandshakeError::UnsupportedSuite(
                "RSN/WPA element kind differs".to_string(),
            ));
        }
        let peer_akms = peer.akms();
        let own_akms = own.akms();
        let akm = policy
            .akms()
            .iter()
            .copied()
            .find(|a| peer_akms.contains(a) && own_akms.contains(a))
            .ok_or_else(|| HandshakeError::UnsupportedSuite("no common AKM".to_string()))?;

        let peer_pairwise = peer.pairwise_ciphers();
        let pairwise = own
            .pairwise_ciphers()
            .into_iter()
            .find(|c| peer_pairwise.contains(c))
            .ok_or_else(|| HandshakeError::UnsupportedSuite("no common pairwise cipher".to_string()))?;

        let group = own
            .group_cipher()
            .or_else(|| peer.group_cipher())
            .ok_or_else(|| HandshakeError::UnsupportedSuite("no group cipher".to_string()))?;
        if let Some(peer_group) = peer.group_cipher() {
            if peer_group != group {
                return Err(HandshakeError::UnsupportedSuite(format!(
                    "group cipher mismatch: {} vs {}",
                    group, peer_group
                )));
            }
        }

        let own_caps = own.capabilities.unwrap_or_default();
        let peer_caps = peer.capabilities.unwrap_or_default();
        if (own_caps.mfpr() && !peer_caps.mfpc()) || (peer_caps.mfpr() && !own_caps.mfpc()) {
            return Err(HandshakeError::UnsupportedSuite(
                "management frame protection required by one side only".to_string(),
            ));
        }
        let group_mgmt = if own_caps.mfpc() && peer_caps.mfpc() {
            Some(own.group_mgmt().unwrap_or(Cipher::BipCmac128))
        } else {
            None
        };

        let descriptor = if own.is_wpa() {
            DescriptorType::Wpa
        } else {
            DescriptorType::Rsn
        };

        Self::new(akm, pairwise, group, group_mgmt, descriptor, legacy_allowed)
    }

    pub fn kdf(&self) -> &dyn KeyDerivation {
        self.kdf.as_ref()
    }

    pub fn mic(&self) -> &dyn MicAlgorithm {
        self.mic.as_ref()
    }

    pub fn key_wrap(&self) -> KeyWrap {
        self.key_wrap
    }

    pub fn mic_len(&self) -> usize {
        self.mic.mic_len()
    }

    /// Total PTK length: KCK + KEK + TK
    pub fn ptk_len(&self) -> usize {
        self.akm.kck_len() + self.akm.kek_len() + self.pairwise.tk_len()
    }

    pub fn is_legacy_wpa(&self) -> bool {
        self.descriptor == DescriptorType::Wpa
    }

    pub fn akm_selector(&self) -> SuiteSelector {
        SuiteSelector::akm(self.akm, self.is_legacy_wpa())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eapol::rsne::RsnCapabilities;

    #[test]
    fn test_psk_ccmp_uses_sha1_family() {
        let suite = CipherSuite::new(
            Akm::Psk,
            Cipher::Ccmp128,
            Cipher::Ccmp128,
            None,
            DescriptorType::Rsn,
            false,
        )
        .unwrap();
        assert_eq!(suite.version, DescriptorVersion::HmacSha1Aes);
        assert_eq!(suite.kdf().name(), "PRF-SHA1");
        assert_eq!(suite.mic().name(), "HMAC-SHA1-128");
        assert_eq!(suite.key_wrap(), KeyWrap::AesKw);
        assert_eq!(suite.ptk_len(), 48);
    }

    #[test]
    fn test_sae_uses_cmac_and_sha256() {
        let suite = CipherSuite::new(
            Akm::Sae,
            Cipher::Ccmp128,
            Cipher::Ccmp128,
            Some(Cipher::BipCmac128),
            DescriptorType::Rsn,
            false,
        )
        .unwrap();
        assert_eq!(suite.version, DescriptorVersion::AkmDefined);
        assert_eq!(suite.kdf().name(), "KDF-SHA256");
        assert_eq!(suite.mic().name(), "AES-128-CMAC");
    }

    #[test]
    fn test_suite_b_192_lengths() {
        let suite = CipherSuite::new(
            Akm::SuiteB192,
            Cipher::Gcmp256,
            Cipher::Gcmp256,
            Some(Cipher::BipGmac256),
            DescriptorType::Rsn,
            false,
        )
        .unwrap();
        assert_eq!(suite.mic_len(), 24);
        assert_eq!(suite.ptk_len(), 24 + 32 + 32);
        assert_eq!(suite.kdf().name(), "KDF-SHA384");
    }

    #[test]
    fn test_tkip_is_longer_than_ccmp() {
        assert!(Cipher::Tkip.tk_len() > Cipher::Ccmp128.tk_len());
    }

    #[test]
    fn test_legacy_rejected_unless_allowed() {
        let err = CipherSuite::new(
            Akm::Psk,
            Cipher::Tkip,
            Cipher::Tkip,
            None,
            DescriptorType::Wpa,
            false,
        );
        assert!(err.is_err());

        let suite = CipherSuite::new(
            Akm::Psk,
            Cipher::Tkip,
            Cipher::Tkip,
            None,
            DescriptorType::Wpa,
            true,
        )
        .unwrap();
        assert_eq!(suite.version, DescriptorVersion::HmacMd5Rc4);
        assert_eq!(suite.key_wrap(), KeyWrap::Rc4);
        assert_eq!(suite.mic().name(), "HMAC-MD5");
    }

    #[test]
    fn test_negotiate_prefers_sae_in_transition_mode() {
        let caps = RsnCapabilities::default().with_mfpc(true);
        let ap = Rsne::build(
            &[Akm::Sae, Akm::Psk],
            &[Cipher::Ccmp128],
            Cipher::Ccmp128,
            Some(caps),
            None,
        );
        let sta = Rsne::build(&[Akm::Sae], &[Cipher::Ccmp128], Cipher::Ccmp128, Some(caps), None);
        let suite =
            CipherSuite::negotiate(SecurityPolicy::Wpa3Transition, &ap, &sta, false).unwrap();
        assert_eq!(suite.akm, Akm::Sae);
        assert_eq!(suite.group_mgmt, Some(Cipher::BipCmac128));
    }

    #[test]
    fn test_negotiate_rejects_pmf_mismatch() {
        let required = RsnCapabilities::default().with_mfpc(true).with_mfpr(true);
        let ap = Rsne::build(&[Akm::Sae], &[Cipher::Ccmp128], Cipher::Ccmp128, Some(required), None);
        let sta = Rsne::build(&[Akm::Sae], &[Cipher::Ccmp128], Cipher::Ccmp128, None, None);
        assert!(CipherSuite::negotiate(SecurityPolicy::Wpa3Sae, &ap, &sta, false).is_err());
    }

    #[test]
    fn test_policy_pmf_and_akm_selection() {
        assert_eq!(SecurityPolicy::Wpa3Sae.pmf(Pmf::Disabled), Pmf::Required);
        assert_eq!(SecurityPolicy::Wpa2Psk.pmf(Pmf::Optional), Pmf::Optional);
        assert_eq!(
            SecurityPolicy::Wpa3Transition.select_akm(&[Akm::Psk]),
            Some(Akm::Psk)
        );
        assert_eq!(SecurityPolicy::Wpa3Sae.select_akm(&[Akm::Psk]), None);
    }
}
