use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result};
use crate::suite::kdf::{mac_over, HmacSha256};
use crate::types::MacAddr;

/// Stateless anti-clogging token issuer
///
/// Tokens are HMAC-SHA256(secret, peer MAC), so checking one needs no
/// per-peer memory.
pub struct AntiClogging {
    secret: Zeroizing<[u8; 32]>,
    threshold: usize,
}

impl AntiClogging {
    pub fn new<R: RngCore + CryptoRng + ?Sized>(rng: &mut R, threshold: usize) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut secret[..]);
        Self { secret, threshold }
    }

    pub fn token_for(&self, peer: MacAddr) -> Result<Vec<u8>> {
        mac_over::<HmacSha256>(&self.secret[..], &[peer.as_bytes()])
    }

    /// Gate a commit before any SAE state is allocated for `peer`
    ///
    /// `pending` counts peers that already hold SAE state. Below the
    /// threshold every commit passes; at or above it the commit must carry
    /// the token issued to this peer.
    pub fn admit(&self, peer: MacAddr, pending: usize, token: Option<&[u8]>) -> Result<()> {
        if pending < self.threshold {
            return Ok(());
        }
        match token {
            Some(t) if bool::from(self.token_for(peer)?.ct_eq(t)) => Ok(()),
            _ => Err(HandshakeError::AntiCloggingRequired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_token_required_only_under_load() {
        let mut rng = StdRng::seed_from_u64(1);
        let gate = AntiClogging::new(&mut rng, 2);
        let peer = MacAddr([2, 0, 0, 0, 0, 9]);
        assert!(gate.admit(peer, 1, None).is_ok());
        assert_eq!(gate.admit(peer, 2, None), Err(HandshakeError::AntiCloggingRequired));

        let token = gate.token_for(peer).unwrap();
        assert!(gate.admit(peer, 5, Some(&token)).is_ok());

        let other = MacAddr([2, 0, 0, 0, 0, 8]);
        assert_eq!(
            gate.admit(other, 5, Some(&token)),
            Err(HandshakeError::AntiCloggingRequired)
        );

        let mut bent = token.clone();
        bent[0] ^= 1;
        assert!(gate.admit(peer, 5, Some(&bent)).is_err());
    }
}
