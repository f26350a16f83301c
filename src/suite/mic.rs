//! EAPOL-Key MIC algorithms, selected by descriptor version or AKM

use aes::Aes128;
use cmac::Cmac;
use hmac::Hmac;
use md5::Md5;
use subtle::ConstantTimeEq;

use super::kdf::{mac_over, HmacSha1, HmacSha256, HmacSha384};
use crate::error::{HandshakeError, Result};

pub trait MicAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of the MIC field on the wire
    fn mic_len(&self) -> usize;

    /// Compute the MIC over `data`, truncated to `mic_len`
    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Constant-time comparison against a received MIC
    fn verify(&self, kck: &[u8], data: &[u8], mic: &[u8]) -> Result<()> {
        let expected = self.compute(kck, data)?;
        if mic.len() == expected.len() && bool::from(expected.ct_eq(mic)) {
            Ok(())
        } else {
            Err(HandshakeError::MicFailure)
        }
    }
}

fn truncated(mut full: Vec<u8>, len: usize) -> Vec<u8> {
    full.truncate(len);
    full
}

/// Descriptor version 1 (WPA/TKIP)
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacMd5Mic;

impl MicAlgorithm for HmacMd5Mic {
    fn name(&self) -> &'static str {
        "HMAC-MD5"
    }

    fn mic_len(&self) -> usize {
        16
    }

    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        mac_over::<Hmac<Md5>>(kck, &[data])
    }
}

/// Descriptor version 2
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha1Mic;

impl MicAlgorithm for HmacSha1Mic {
    fn name(&self) -> &'static str {
        "HMAC-SHA1-128"
    }

    fn mic_len(&self) -> usize {
        16
    }

    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(truncated(mac_over::<HmacSha1>(kck, &[data])?, 16))
    }
}

/// Descriptor version 3 and SAE
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCmacMic;

impl MicAlgorithm for AesCmacMic {
    fn name(&self) -> &'static str {
        "AES-128-CMAC"
    }

    fn mic_len(&self) -> usize {
        16
    }

    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        mac_over::<Cmac<Aes128>>(kck, &[data])
    }
}

/// Suite B (AKM 11)
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Mic;

impl MicAlgorithm for HmacSha256Mic {
    fn name(&self) -> &'static str {
        "HMAC-SHA256-128"
    }

    fn mic_len(&self) -> usize {
        16
    }

    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(truncated(mac_over::<HmacSha256>(kck, &[data])?, 16))
    }
}

/// Suite B 192-bit (AKM 12)
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha384Mic;

impl MicAlgorithm for HmacSha384Mic {
    fn name(&self) -> &'static str {
        "HMAC-SHA384-192"
    }

    fn mic_len(&self) -> usize {
        24
    }

    fn compute(&self, kck: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(truncated(mac_over::<HmacSha384>(kck, &[data])?, 24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmac_rfc4493_vector() {
        // RFC 4493 example 2
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let mic = AesCmacMic.compute(&key, &msg).unwrap();
        assert_eq!(hex::encode(mic), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn test_mic_lengths() {
        let kck = [0x11u8; 24];
        assert_eq!(HmacSha1Mic.compute(&kck[..16], b"frame").unwrap().len(), 16);
        assert_eq!(HmacMd5Mic.compute(&kck[..16], b"frame").unwrap().len(), 16);
        assert_eq!(HmacSha256Mic.compute(&kck[..16], b"frame").unwrap().len(), 16);
        assert_eq!(HmacSha384Mic.compute(&kck, b"frame").unwrap().len(), 24);
    }

    #[test]
    fn test_verify_rejects_any_flipped_bit() {
        let kck = [0x42u8; 16];
        let data = b"eapol key frame body";
        let mic = HmacSha1Mic.compute(&kck, data).unwrap();
        assert!(HmacSha1Mic.verify(&kck, data, &mic).is_ok());
        for i in 0..mic.len() {
            let mut bad = mic.clone();
            bad[i] ^= 0x01;
            assert_eq!(
                HmacSha1Mic.verify(&kck, data, &bad),
                Err(HandshakeError::MicFailure)
            );
        }
        assert_eq!(
            HmacSha1Mic.verify(&kck, data, &mic[..8]),
            Err(HandshakeError::MicFailure)
        );
    }

    #[test]
    fn test_cmac_rejects_wrong_key_length() {
        assert!(matches!(
            AesCmacMic.compute(&[0u8; 24], b"x"),
            Err(HandshakeError::Crypto(_))
        ));
    }
}
