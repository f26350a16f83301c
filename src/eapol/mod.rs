pub mod kde;
pub mod key_info;
pub mod rsne;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result};
use crate::keys::Ptk;
use crate::suite::CipherSuite;
use crate::types::Nonce;
use kde::pad_for_wrap;
use key_info::{DescriptorType, KeyInfo, KeyType};
use crate::keys::wrap::KeyWrap;

/// Ethertype of EAPOL frames
pub const ETHERTYPE_EAPOL: u16 = 0x888E;
/// 802.1X-2004
pub const EAPOL_VERSION: u8 = 2;
pub const EAPOL_PACKET_KEY: u8 = 3;
pub const HEADER_LEN: usize = 4;
/// Descriptor fields before the MIC:
/// Type(1) + KeyInfo(2) + KeyLen(2) + Replay(8) + Nonce(32) + IV(16) + RSC(8) + KeyID(8)
const PRE_MIC_LEN: usize = 77;
/// Offset of the MIC from the start of the EAPOL header
pub const MIC_OFFSET: usize = HEADER_LEN + PRE_MIC_LEN;

/// Role a key frame plays in the pairwise or group handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PairwiseMsg1,
    PairwiseMsg2,
    PairwiseMsg3,
    PairwiseMsg4,
    GroupMsg1,
    GroupMsg2,
    /// Supplicant-originated request (rekey or MIC failure report)
    Request,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::PairwiseMsg1 => "message 1/4",
            MessageKind::PairwiseMsg2 => "message 2/4",
            MessageKind::PairwiseMsg3 => "message 3/4",
            MessageKind::PairwiseMsg4 => "message 4/4",
            MessageKind::GroupMsg1 => "group message 1/2",
            MessageKind::GroupMsg2 => "group message 2/2",
            MessageKind::Request => "EAPOL-Key request",
        }
    }

    /// Whether the key data of this message is encrypted with the KEK
    pub fn encrypts_key_data(&self, suite: &CipherSuite) -> bool {
        match self {
            MessageKind::GroupMsg1 => true,
            MessageKind::PairwiseMsg3 => !suite.is_legacy_wpa(),
            _ => false,
        }
    }
}

/// Decoded EAPOL-Key frame (header + key descriptor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFrame {
    pub protocol_version: u8,
    pub descriptor_type: DescriptorType,
    pub key_info: KeyInfo,
    pub key_length: u16,
    pub replay_counter: u64,
    pub nonce: Nonce,
    pub iv: [u8; 16],
    /// Key RSC, least significant octet first on the wire
    pub rsc: u64,
    pub key_id: [u8; 8],
    pub mic: Vec<u8>,
    pub key_data: Vec<u8>,
}

impl KeyFrame {
    /// Decode a frame whose MIC field is `mic_len` bytes
    pub fn decode(data: &[u8], mic_len: usize) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(HandshakeError::MalformedFrame(format!(
                "EAPOL frame too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let protocol_version = buf.get_u8();
        if !(1..=3).contains(&protocol_version) {
            return Err(HandshakeError::MalformedFrame(format!(
                "EAPOL version {}",
                protocol_version
            )));
        }
        let packet_type = buf.get_u8();
        if packet_type != EAPOL_PACKET_KEY {
            return Err(HandshakeError::MalformedFrame(format!(
                "EAPOL packet type {} is not EAPOL-Key",
                packet_type
            )));
        }
        let body_len = buf.get_u16() as usize;
        if buf.remaining() < body_len {
            return Err(HandshakeError::MalformedFrame(format!(
                "body length {} exceeds frame ({} bytes left)",
                body_len,
                buf.remaining()
            )));
        }
        // Fixed descriptor + MIC + KeyDataLen(2)
        if body_len < PRE_MIC_LEN + mic_len + 2 {
            return Err(HandshakeError::MalformedFrame(format!(
                "key descriptor too short: {} bytes",
                body_len
            )));
        }
        let mut body = &buf[..body_len];

        let descriptor_type = DescriptorType::try_from(body.get_u8())?;
        let key_info = KeyInfo::try_from(body.get_u16())?;
        let key_length = body.get_u16();
        let replay_counter = body.get_u64();
        let mut nonce = [0u8; 32];
        body.copy_to_slice(&mut nonce);
        let mut iv = [0u8; 16];
        body.copy_to_slice(&mut iv);
        let rsc = body.get_u64_le();
        let mut key_id = [0u8; 8];
        body.copy_to_slice(&mut key_id);
        let mut mic = vec![0u8; mic_len];
        body.copy_to_slice(&mut mic);
        let key_data_len = body.get_u16() as usize;
        if body.remaining() != key_data_len {
            return Err(HandshakeError::MalformedFrame(format!(
                "key data length {} does not match {} remaining bytes",
                key_data_len,
                body.remaining()
            )));
        }

        Ok(Self {
            protocol_version,
            descriptor_type,
            key_info,
            key_length,
            replay_counter,
            nonce,
            iv,
            rsc,
            key_id,
            mic,
            key_data: body.to_vec(),
        })
    }

    /// Decode and check the descriptor against the negotiated suite
    ///
    /// A descriptor version that differs from the negotiated one is treated
    /// as a downgrade attempt and rejected.
    pub fn decode_for(data: &[u8], suite: &CipherSuite) -> Result<Self> {
        let frame = Self::decode(data, suite.mic_len())?;
        if frame.descriptor_type != suite.descriptor {
            return Err(HandshakeError::MalformedFrame(format!(
                "descriptor type {:?}, expected {:?}",
                frame.descriptor_type, suite.descriptor
            )));
        }
        if frame.key_info.version != suite.version {
            return Err(HandshakeError::MalformedFrame(format!(
                "descriptor version {:?}, negotiated {:?}",
                frame.key_info.version, suite.version
            )));
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Bytes {
        let body_len = PRE_MIC_LEN + self.mic.len() + 2 + self.key_data.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(self.protocol_version);
        buf.put_u8(EAPOL_PACKET_KEY);
        buf.put_u16(body_len as u16);
        buf.put_u8(self.descriptor_type as u8);
        buf.put_u16(self.key_info.to_u16());
        buf.put_u16(self.key_length);
        buf.put_u64(self.replay_counter);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.iv);
        buf.put_u64_le(self.rsc);
        buf.put_slice(&self.key_id);
        buf.put_slice(&self.mic);
        buf.put_u16(self.key_data.len() as u16);
        buf.put_slice(&self.key_data);
        buf.freeze()
    }

    /// Classify from the Key Information bits. Message 2 and 4 share their
    /// bits; message 4 carries neither a nonce nor key data.
    pub fn message_kind(&self) -> Result<MessageKind> {
        let info = &self.key_info;
        if info.request {
            return Ok(MessageKind::Request);
        }
        match (info.key_type, info.ack, info.mic) {
            (KeyType::Pairwise, true, false) => Ok(MessageKind::PairwiseMsg1),
            (KeyType::Pairwise, true, true) if info.install => Ok(MessageKind::PairwiseMsg3),
            (KeyType::Pairwise, false, true) => {
                if self.nonce.iter().all(|b| *b == 0) && self.key_data.is_empty() {
                    Ok(MessageKind::PairwiseMsg4)
                } else {
                    Ok(MessageKind::PairwiseMsg2)
                }
            }
            (KeyType::Group, true, true) => Ok(MessageKind::GroupMsg1),
            (KeyType::Group, false, true) => Ok(MessageKind::GroupMsg2),
            _ => Err(HandshakeError::MalformedFrame(format!(
                "unclassifiable key info {}",
                info
            ))),
        }
    }
}

impl fmt::Display for KeyFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self
            .message_kind()
            .map(|k| k.name())
            .unwrap_or("unknown");
        write!(
            f,
            "EAPOL-Key {} info={} replay={} keydata={} bytes",
            kind,
            self.key_info,
            self.replay_counter,
            self.key_data.len()
        )
    }
}

/// Per-message fields for [`build_key_frame`]
#[derive(Debug, Clone, Default)]
pub struct FrameParams<'a> {
    pub replay_counter: u64,
    pub nonce: Nonce,
    /// Plaintext key data; encrypted here when the message requires it
    pub key_data: &'a [u8],
    pub rsc: u64,
    /// EAPOL key IV (RC4 key data only)
    pub iv: [u8; 16],
    /// GTK index in WPA group messages
    pub key_index: u8,
    /// Request frames: report a MIC failure
    pub error: bool,
    /// Request frames: ask for a pairwise rather than a group rekey
    pub pairwise_request: bool,
    /// Request frames: set once a PTK is installed
    pub secure: bool,
}

fn key_info_for(kind: MessageKind, suite: &CipherSuite, params: &FrameParams) -> KeyInfo {
    let wpa = suite.is_legacy_wpa();
    let mut info = KeyInfo::new(suite.version, KeyType::Pairwise);
    match kind {
        MessageKind::PairwiseMsg1 => info.ack = true,
        MessageKind::PairwiseMsg2 => info.mic = true,
        MessageKind::PairwiseMsg3 => {
            info.install = true;
            info.ack = true;
            info.mic = true;
            info.secure = !wpa;
            info.encrypted_key_data = !wpa;
        }
        MessageKind::PairwiseMsg4 => {
            info.mic = true;
            info.secure = !wpa;
        }
        MessageKind::GroupMsg1 => {
            info.key_type = KeyType::Group;
            info.ack = true;
            info.mic = true;
            info.secure = true;
            info.encrypted_key_data = !wpa;
            if wpa {
                info.key_index = params.key_index;
            }
        }
        MessageKind::GroupMsg2 => {
            info.key_type = KeyType::Group;
            info.mic = true;
            info.secure = true;
            if wpa {
                info.key_index = params.key_index;
            }
        }
        MessageKind::Request => {
            info.key_type = if params.pairwise_request {
                KeyType::Pairwise
            } else {
                KeyType::Group
            };
            info.request = true;
            info.mic = true;
            info.secure = params.secure;
            info.error = params.error;
        }
    }
    info
}

/// Encode a complete outbound EAPOL-Key frame
///
/// Key data is encrypted under the KEK when the message kind requires it,
/// and the MIC is computed over the whole frame with the MIC field zeroed.
/// Message 1 is the only kind that can be built without a PTK.
pub fn build_key_frame(
    suite: &CipherSuite,
    kind: MessageKind,
    params: &FrameParams,
    ptk: Option<&Ptk>,
) -> Result<Bytes> {
    let info = key_info_for(kind, suite, params);
    let key_length = match kind {
        MessageKind::PairwiseMsg1 | MessageKind::PairwiseMsg3 => suite.pairwise.tk_len() as u16,
        MessageKind::GroupMsg1 if suite.is_legacy_wpa() => suite.group.tk_len() as u16,
        _ => 0,
    };

    let key_data = if kind.encrypts_key_data(suite) {
        let ptk = ptk.ok_or(HandshakeError::InvalidState {
            operation: "encrypt key data",
            state: "no PTK",
        })?;
        match suite.key_wrap() {
            KeyWrap::AesKw => {
                let mut padded = Zeroizing::new(params.key_data.to_vec());
                pad_for_wrap(&mut padded);
                suite.key_wrap().wrap(ptk.kek(), &params.iv, &padded)?
            }
            KeyWrap::Rc4 => suite.key_wrap().wrap(ptk.kek(), &params.iv, params.key_data)?,
        }
    } else {
        params.key_data.to_vec()
    };

    let iv = match suite.key_wrap() {
        KeyWrap::Rc4 => params.iv,
        KeyWrap::AesKw => [0u8; 16],
    };

    let mut frame = KeyFrame {
        protocol_version: EAPOL_VERSION,
        descriptor_type: suite.descriptor,
        key_info: info,
        key_length,
        replay_counter: params.replay_counter,
        nonce: params.nonce,
        iv,
        rsc: params.rsc,
        key_id: [0u8; 8],
        mic: vec![0u8; suite.mic_len()],
        key_data,
    };

    if !info.mic {
        return Ok(frame.encode());
    }
    let ptk = ptk.ok_or(HandshakeError::InvalidState {
        operation: "compute MIC",
        state: "no PTK",
    })?;
    let unsigned = frame.encode();
    frame.mic = suite.mic().compute(ptk.kck(), &unsigned)?;
    Ok(frame.encode())
}

/// Verify the MIC of a raw EAPOL-Key frame under `kck`
///
/// The MIC is recomputed over the EAPOL header and body exactly as received,
/// with the MIC field zeroed. Bytes past the length in the EAPOL header are
/// link-layer padding: they are not covered and not checked.
pub fn verify_mic(suite: &CipherSuite, kck: &[u8], raw: &[u8]) -> Result<()> {
    let mic_len = suite.mic_len();
    if raw.len() < HEADER_LEN {
        return Err(HandshakeError::MalformedFrame("EAPOL frame too short".to_string()));
    }
    let eapol_len = HEADER_LEN + u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if raw.len() < eapol_len || eapol_len < MIC_OFFSET + mic_len {
        return Err(HandshakeError::MalformedFrame("EAPOL length out of range".to_string()));
    }
    let mut covered = raw[..eapol_len].to_vec();
    covered[MIC_OFFSET..MIC_OFFSET + mic_len].fill(0);
    suite
        .mic()
        .verify(kck, &covered, &raw[MIC_OFFSET..MIC_OFFSET + mic_len])
}

/// Recover the plaintext key data of a frame
pub fn decrypt_key_data(
    suite: &CipherSuite,
    ptk: &Ptk,
    frame: &KeyFrame,
) -> Result<Zeroizing<Vec<u8>>> {
    let encrypted = if suite.is_legacy_wpa() {
        frame.key_info.key_type == KeyType::Group && !frame.key_data.is_empty()
    } else {
        frame.key_info.encrypted_key_data
    };
    if !encrypted {
        return Ok(Zeroizing::new(frame.key_data.clone()));
    }
    suite
        .key_wrap()
        .unwrap(ptk.kek(), &frame.iv, &frame.key_data)
        .map_err(|_| HandshakeError::KeyDataDecryptFailure)
}
