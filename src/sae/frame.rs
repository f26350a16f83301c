//! SAE authentication frame bodies
//!
//! Authentication frame body: Algorithm(2) + Transaction(2) + Status(2),
//! then for a commit Group(2) + [Token] + Scalar + Element, for a confirm
//! SendConfirm(2) + Confirm(32). All integers little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use super::group::{ELEMENT_LEN, GROUP_19, SCALAR_LEN};
use crate::error::{HandshakeError, Result, StatusCode};

pub const AUTH_ALGORITHM_SAE: u16 = 3;
pub const TRANSACTION_COMMIT: u16 = 1;
pub const TRANSACTION_CONFIRM: u16 = 2;
pub const CONFIRM_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct SaeCommit {
    pub group: u16,
    /// Sent with status 126 (hash-to-element) rather than 0
    pub h2e: bool,
    pub token: Option<Vec<u8>>,
    pub scalar: Vec<u8>,
    pub element: Vec<u8>,
}

impl fmt::Debug for SaeCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaeCommit")
            .field("group", &self.group)
            .field("h2e", &self.h2e)
            .field("token", &self.token.as_ref().map(|t| t.len()))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeConfirm {
    pub send_confirm: u16,
    pub confirm: [u8; CONFIRM_LEN],
}

/// Decoded SAE authentication frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaeMessage {
    Commit(SaeCommit),
    Confirm(SaeConfirm),
    /// Responder demands this token be echoed in a new commit (status 76)
    TokenRequest { group: u16, token: Vec<u8> },
    /// Any other non-success status
    Rejected { transaction: u16, status: u16 },
}

impl SaeMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16_le(AUTH_ALGORITHM_SAE);
        match self {
            SaeMessage::Commit(commit) => {
                buf.put_u16_le(TRANSACTION_COMMIT);
                let status = if commit.h2e {
                    StatusCode::SaeHashToElement
                } else {
                    StatusCode::Success
                };
                buf.put_u16_le(status as u16);
                buf.put_u16_le(commit.group);
                if let Some(token) = &commit.token {
                    buf.put_slice(token);
                }
                buf.put_slice(&commit.scalar);
                buf.put_slice(&commit.element);
            }
            SaeMessage::Confirm(confirm) => {
                buf.put_u16_le(TRANSACTION_CONFIRM);
                buf.put_u16_le(StatusCode::Success as u16);
                buf.put_u16_le(confirm.send_confirm);
                buf.put_slice(&confirm.confirm);
            }
            SaeMessage::TokenRequest { group, token } => {
                buf.put_u16_le(TRANSACTION_COMMIT);
                buf.put_u16_le(StatusCode::AntiCloggingTokenRequired as u16);
                buf.put_u16_le(*group);
                buf.put_slice(token);
            }
            SaeMessage::Rejected { transaction, status } => {
                buf.put_u16_le(*transaction);
                buf.put_u16_le(*status);
                if *transaction == TRANSACTION_COMMIT
                    && *status == StatusCode::UnsupportedFiniteCyclicGroup as u16
                {
                    // Name the group we do support
                    buf.put_u16_le(GROUP_19);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 6 {
            return Err(HandshakeError::MalformedFrame(format!(
                "authentication frame too short: {} bytes",
                data.len()
            )));
        }
        let algorithm = buf.get_u16_le();
        if algorithm != AUTH_ALGORITHM_SAE {
            return Err(HandshakeError::MalformedFrame(format!(
                "authentication algorithm {} is not SAE",
                algorithm
            )));
        }
        let transaction = buf.get_u16_le();
        let status = buf.get_u16_le();
        let known = StatusCode::try_from(status).ok();

        match (transaction, known) {
            (TRANSACTION_COMMIT, Some(StatusCode::Success))
            | (TRANSACTION_COMMIT, Some(StatusCode::SaeHashToElement)) => {
                if buf.remaining() < 2 {
                    return Err(HandshakeError::MalformedFrame("commit without group".to_string()));
                }
                let group = buf.get_u16_le();
                let h2e = known == Some(StatusCode::SaeHashToElement);
                if group != GROUP_19 {
                    // Element sizes are unknown for other groups; the
                    // exchange rejects the group before looking at them.
                    return Ok(SaeMessage::Commit(SaeCommit {
                        group,
                        h2e,
                        token: None,
                        scalar: Vec::new(),
                        element: Vec::new(),
                    }));
                }
                let fixed = SCALAR_LEN + ELEMENT_LEN;
                if buf.remaining() < fixed {
                    return Err(HandshakeError::MalformedFrame(format!(
                        "commit body of {} bytes",
                        buf.remaining()
                    )));
                }
                let token_len = buf.remaining() - fixed;
                let token = (token_len > 0).then(|| buf[..token_len].to_vec());
                buf.advance(token_len);
                let scalar = buf[..SCALAR_LEN].to_vec();
                let element = buf[SCALAR_LEN..fixed].to_vec();
                Ok(SaeMessage::Commit(SaeCommit {
                    group,
                    h2e,
                    token,
                    scalar,
                    element,
                }))
            }
            (TRANSACTION_COMMIT, Some(StatusCode::AntiCloggingTokenRequired)) => {
                if buf.remaining() < 3 {
                    return Err(HandshakeError::MalformedFrame(
                        "token request without token".to_string(),
                    ));
                }
                let group = buf.get_u16_le();
                Ok(SaeMessage::TokenRequest {
                    group,
                    token: buf.to_vec(),
                })
            }
            (TRANSACTION_CONFIRM, Some(StatusCode::Success)) => {
                if buf.remaining() != 2 + CONFIRM_LEN {
                    return Err(HandshakeError::MalformedFrame(format!(
                        "confirm body of {} bytes",
                        buf.remaining()
                    )));
                }
                let send_confirm = buf.get_u16_le();
                let mut confirm = [0u8; CONFIRM_LEN];
                buf.copy_to_slice(&mut confirm);
                Ok(SaeMessage::Confirm(SaeConfirm {
                    send_confirm,
                    confirm,
                }))
            }
            (TRANSACTION_COMMIT | TRANSACTION_CONFIRM, _) => {
                Ok(SaeMessage::Rejected { transaction, status })
            }
            _ => Err(HandshakeError::MalformedFrame(format!(
                "unknown SAE transaction {}",
                transaction
            ))),
        }
    }

    pub fn transaction(&self) -> u16 {
        match self {
            SaeMessage::Commit(_) | SaeMessage::TokenRequest { .. } => TRANSACTION_COMMIT,
            SaeMessage::Confirm(_) => TRANSACTION_CONFIRM,
            SaeMessage::Rejected { transaction, .. } => *transaction,
        }
    }
}

impl fmt::Display for SaeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaeMessage::Commit(c) => write!(
                f,
                "SAE commit group={} h2e={} token={}",
                c.group,
                c.h2e,
                c.token.is_some()
            ),
            SaeMessage::Confirm(c) => write!(f, "SAE confirm send_confirm={}", c.send_confirm),
            SaeMessage::TokenRequest { group, token } => {
                write!(f, "SAE token request group={} ({} bytes)", group, token.len())
            }
            SaeMessage::Rejected { transaction, status } => {
                write!(f, "SAE rejection seq={} status={}", transaction, status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(token: Option<Vec<u8>>) -> SaeCommit {
        SaeCommit {
            group: GROUP_19,
            h2e: false,
            token,
            scalar: vec![0x11; SCALAR_LEN],
            element: vec![0x22; ELEMENT_LEN],
        }
    }

    #[test]
    fn test_commit_layout() {
        let raw = SaeMessage::Commit(commit(None)).encode();
        assert_eq!(raw.len(), 6 + 2 + 96);
        assert_eq!(&raw[..8], &[3, 0, 1, 0, 0, 0, 19, 0]);
        assert_eq!(SaeMessage::decode(&raw).unwrap(), SaeMessage::Commit(commit(None)));
    }

    #[test]
    fn test_commit_token_is_split_from_scalar() {
        let msg = SaeMessage::Commit(commit(Some(vec![0xAB; 32])));
        match SaeMessage::decode(&msg.encode()).unwrap() {
            SaeMessage::Commit(c) => {
                assert_eq!(c.token, Some(vec![0xAB; 32]));
                assert_eq!(c.scalar, vec![0x11; SCALAR_LEN]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_group_commit_decodes_without_material() {
        let raw = [3, 0, 1, 0, 0, 0, 20, 0, 1, 2, 3];
        match SaeMessage::decode(&raw).unwrap() {
            SaeMessage::Commit(c) => {
                assert_eq!(c.group, 20);
                assert!(c.scalar.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_token_request_and_rejection() {
        let req = SaeMessage::TokenRequest {
            group: GROUP_19,
            token: vec![9; 32],
        };
        assert_eq!(SaeMessage::decode(&req.encode()).unwrap(), req);

        let rej = SaeMessage::Rejected {
            transaction: TRANSACTION_COMMIT,
            status: StatusCode::UnsupportedFiniteCyclicGroup as u16,
        };
        assert_eq!(SaeMessage::decode(&rej.encode()).unwrap(), rej);
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(SaeMessage::decode(&[3, 0, 1]).is_err());
        assert!(SaeMessage::decode(&[1, 0, 1, 0, 0, 0]).is_err());
        assert!(SaeMessage::decode(&[3, 0, 2, 0, 0, 0, 1, 0]).is_err());
        assert!(SaeMessage::decode(&[3, 0, 1, 0, 0, 0, 19, 0, 1]).is_err());
    }
}
