//! Error taxonomy for the handshake engine
//!
//! Every failure is local to one session. `HandshakeError::disposition`
//! tells the caller what to do with the session after the error: drop the
//! offending frame, abort the attempt and deauthenticate, tear down, or
//! answer an SAE peer with a status code.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("MIC verification failed")]
    MicFailure,

    #[error("replay counter {received} rejected (last accepted {last:?})")]
    ReplayViolation { received: u64, last: Option<u64> },

    #[error("key data decryption failed")]
    KeyDataDecryptFailure,

    #[error("retry budget exhausted")]
    RetryExhausted,

    #[error("unsupported or downgraded SAE group {0}")]
    UnsupportedOrDowngradedGroup(u16),

    #[error("anti-clogging token required")]
    AntiCloggingRequired,

    #[error("information element differs from the one advertised")]
    IeMismatch,

    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },

    #[error("invalid state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("unsupported suite: {0}")]
    UnsupportedSuite(String),

    #[error("SAE commit rejected: {0}")]
    SaeCommitRejected(String),

    #[error("SAE confirm verification failed")]
    SaeConfirmFailure,

    #[error("cryptographic error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

/// What the owner of a session does after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the frame silently; the session stays where it was
    Drop,
    /// Abort the handshake attempt and deauthenticate the peer
    Abort(ReasonCode),
    /// Tear the session down and deauthenticate the peer
    Teardown(ReasonCode),
    /// Answer the SAE peer with this status; no PMK is produced
    Reject(StatusCode),
}

impl HandshakeError {
    pub fn disposition(&self) -> Disposition {
        match self {
            HandshakeError::MalformedFrame(_)
            | HandshakeError::MicFailure
            | HandshakeError::ReplayViolation { .. }
            | HandshakeError::UnexpectedMessage { .. }
            | HandshakeError::InvalidState { .. } => Disposition::Drop,
            HandshakeError::KeyDataDecryptFailure => Disposition::Abort(ReasonCode::Unspecified),
            HandshakeError::IeMismatch => Disposition::Abort(ReasonCode::IeInFourWayDiffers),
            HandshakeError::UnsupportedSuite(_) => Disposition::Abort(ReasonCode::CipherSuiteRejected),
            HandshakeError::Crypto(_) => Disposition::Abort(ReasonCode::Unspecified),
            HandshakeError::RetryExhausted => {
                Disposition::Teardown(ReasonCode::FourWayHandshakeTimeout)
            }
            HandshakeError::UnsupportedOrDowngradedGroup(_) => {
                Disposition::Reject(StatusCode::UnsupportedFiniteCyclicGroup)
            }
            HandshakeError::AntiCloggingRequired => {
                Disposition::Reject(StatusCode::AntiCloggingTokenRequired)
            }
            HandshakeError::SaeCommitRejected(_) | HandshakeError::SaeConfirmFailure => {
                Disposition::Reject(StatusCode::Unspecified)
            }
        }
    }
}

/// IEEE 802.11 reason codes sent with a deauthentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReasonCode {
    Unspecified = 1,
    PrevAuthNotValid = 2,
    DeauthLeaving = 3,
    InvalidIe = 13,
    MichaelMicFailure = 14,
    FourWayHandshakeTimeout = 15,
    GroupKeyUpdateTimeout = 16,
    IeInFourWayDiffers = 17,
    GroupCipherNotValid = 18,
    PairwiseCipherNotValid = 19,
    AkmpNotValid = 20,
    Ieee8021xAuthFailed = 23,
    CipherSuiteRejected = 24,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

/// IEEE 802.11 status codes carried in SAE authentication frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    Unspecified = 1,
    AntiCloggingTokenRequired = 76,
    UnsupportedFiniteCyclicGroup = 77,
    SaeHashToElement = 126,
}

impl TryFrom<u16> for StatusCode {
    type Error = HandshakeError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(StatusCode::Success),
            1 => Ok(StatusCode::Unspecified),
            76 => Ok(StatusCode::AntiCloggingTokenRequired),
            77 => Ok(StatusCode::UnsupportedFiniteCyclicGroup),
            126 => Ok(StatusCode::SaeHashToElement),
            other => Err(HandshakeError::MalformedFrame(format!(
                "unknown status code {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions_follow_taxonomy() {
        assert_eq!(HandshakeError::MicFailure.disposition(), Disposition::Drop);
        assert_eq!(
            HandshakeError::ReplayViolation { received: 1, last: Some(2) }.disposition(),
            Disposition::Drop
        );
        assert!(matches!(
            HandshakeError::KeyDataDecryptFailure.disposition(),
            Disposition::Abort(_)
        ));
        assert_eq!(
            HandshakeError::RetryExhausted.disposition(),
            Disposition::Teardown(ReasonCode::FourWayHandshakeTimeout)
        );
        assert_eq!(
            HandshakeError::UnsupportedOrDowngradedGroup(20).disposition(),
            Disposition::Reject(StatusCode::UnsupportedFiniteCyclicGroup)
        );
        assert_eq!(
            HandshakeError::AntiCloggingRequired.disposition(),
            Disposition::Reject(StatusCode::AntiCloggingTokenRequired)
        );
    }

    #[test]
    fn test_status_code_roundtrip_rejects_unknown() {
        assert_eq!(StatusCode::try_from(77).unwrap(), StatusCode::UnsupportedFiniteCyclicGroup);
        assert!(StatusCode::try_from(9999).is_err());
    }
}
