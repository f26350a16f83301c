//! Simultaneous Authentication of Equals (WPA3-Personal)
//!
//! Both peers run the same exchange: each sends a commit (scalar and
//! element), derives the shared secret from the other's commit, then proves
//! knowledge of it with a confirm. The exchange yields a PMK and PMKID and
//! is discarded afterwards.

pub mod anti_clogging;
pub mod frame;
pub mod group;

use p256::{ProjectivePoint, Scalar};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result, StatusCode};
use crate::keys::Pmk;
use crate::suite::kdf::{mac_over, HmacSha256, KdfSha256, KeyDerivation};
use crate::types::{MacAddr, Pmkid};
pub use anti_clogging::AntiClogging;
pub use frame::{SaeCommit, SaeConfirm, SaeMessage};
use group::{
    decode_element, decode_scalar, derive_pwe, encode_element, encode_scalar, random_scalar,
    x_coordinate, PweMethod, GROUP_19,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaeState {
    Nothing,
    Committed,
    Confirmed,
    Accepted,
}

impl SaeState {
    pub fn name(&self) -> &'static str {
        match self {
            SaeState::Nothing => "Nothing",
            SaeState::Committed => "Committed",
            SaeState::Confirmed => "Confirmed",
            SaeState::Accepted => "Accepted",
        }
    }
}

/// Which password element methods a responder accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum H2eMode {
    /// Hunting-and-pecking only
    #[default]
    Disabled,
    /// Either method, following the peer's commit
    Enabled,
    /// Hash-to-element only
    Required,
}

impl H2eMode {
    /// Method a station uses toward an AP that does or does not advertise
    /// H2E in its RSNXE
    pub fn method_for(self, peer_h2e: bool) -> PweMethod {
        match (self, peer_h2e) {
            (H2eMode::Required, _) | (H2eMode::Enabled, true) => PweMethod::HashToElement,
            _ => PweMethod::HuntingAndPecking,
        }
    }
}

/// Per-exchange settings
#[derive(Debug, Clone)]
pub struct SaeParams {
    /// Supported groups, most preferred first
    pub groups: Vec<u16>,
    pub pwe: PweMethod,
    /// Retransmissions allowed before the exchange is abandoned
    pub sync_max: u32,
}

impl Default for SaeParams {
    fn default() -> Self {
        Self {
            groups: vec![GROUP_19],
            pwe: PweMethod::HuntingAndPecking,
            sync_max: 5,
        }
    }
}

/// Keys produced by a completed exchange
#[derive(Clone, PartialEq, Eq)]
pub struct SaeKeys {
    pub pmk: Pmk,
    pub pmkid: Pmkid,
}

impl fmt::Debug for SaeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaeKeys(pmkid={})", self.pmkid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Peer commit accepted: send our commit (if not sent yet) and confirm
    Accept {
        commit: Option<SaeCommit>,
        confirm: SaeConfirm,
    },
    /// Refuse the commit with this status; no PMK material exists
    Reject(StatusCode),
    /// Under load: ask the peer to echo this token
    RequestToken(Vec<u8>),
}

pub struct SaeExchange {
    own: MacAddr,
    peer: MacAddr,
    password: Zeroizing<Vec<u8>>,
    ssid: Vec<u8>,
    params: SaeParams,
    state: SaeState,
    pwe: Option<ProjectivePoint>,
    rand: Option<Zeroizing<Scalar>>,
    own_scalar: Option<Scalar>,
    own_element: Option<ProjectivePoint>,
    peer_scalar: Option<Scalar>,
    peer_element: Option<ProjectivePoint>,
    peer_commit: Option<SaeCommit>,
    kck: Option<Zeroizing<Vec<u8>>>,
    keys: Option<SaeKeys>,
    send_confirm: u16,
    token: Option<Vec<u8>>,
    sync: u32,
    last_commit: Option<SaeCommit>,
}

impl fmt::Debug for SaeExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaeExchange")
            .field("own", &self.own)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl SaeExchange {
    pub fn new(own: MacAddr, peer: MacAddr, password: &[u8], ssid: &[u8], params: SaeParams) -> Self {
        Self {
            own,
            peer,
            password: Zeroizing::new(password.to_vec()),
            ssid: ssid.to_vec(),
            params,
            state: SaeState::Nothing,
            pwe: None,
            rand: None,
            own_scalar: None,
            own_element: None,
            peer_scalar: None,
            peer_element: None,
            peer_commit: None,
            kck: None,
            keys: None,
            send_confirm: 1,
            token: None,
            sync: 0,
            last_commit: None,
        }
    }

    pub fn state(&self) -> SaeState {
        self.state
    }

    pub fn peer(&self) -> MacAddr {
        self.peer
    }

    pub fn keys(&self) -> Option<&SaeKeys> {
        self.keys.as_ref()
    }

    fn invalid(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    fn uses_h2e(&self) -> bool {
        self.params.pwe == PweMethod::HashToElement
    }

    /// Build and remember our commit
    pub fn commit<R: RngCore + CryptoRng + ?Sized>(&mut self, rng: &mut R) -> Result<SaeCommit> {
        if self.state != SaeState::Nothing {
            return Err(self.invalid("SAE commit"));
        }
        let group = self
            .params
            .groups
            .first()
            .copied()
            .ok_or_else(|| HandshakeError::UnsupportedSuite("no SAE groups configured".to_string()))?;
        if group != GROUP_19 {
            return Err(HandshakeError::UnsupportedOrDowngradedGroup(group));
        }

        let pwe = match self.pwe {
            Some(p) => p,
            None => {
                let method = self.params.pwe;
                let p = derive_pwe(method, &self.password, &self.ssid, self.own, self.peer)?;
                self.pwe = Some(p);
                p
            }
        };

        let (rand, mask, scalar) = loop {
            let rand = random_scalar(rng);
            let mask = random_scalar(rng);
            let scalar = rand + mask;
            if !bool::from(scalar.ct_eq(&Scalar::ZERO)) && scalar != Scalar::ONE {
                break (rand, mask, scalar);
            }
        };
        let element = -(pwe * mask);

        self.rand = Some(Zeroizing::new(rand));
        self.own_scalar = Some(scalar);
        self.own_element = Some(element);
        self.state = SaeState::Committed;
        self.sync = 0;

        let commit = self.commit_message()?;
        debug!(peer = %self.peer, h2e = self.uses_h2e(), "SAE commit built");
        Ok(commit)
    }

    fn commit_message(&mut self) -> Result<SaeCommit> {
        let (scalar, element) = match (&self.own_scalar, &self.own_element) {
            (Some(s), Some(e)) => (encode_scalar(s), encode_element(e)?),
            _ => return Err(self.invalid("SAE commit message")),
        };
        let commit = SaeCommit {
            group: GROUP_19,
            h2e: self.uses_h2e(),
            token: self.token.clone(),
            scalar: scalar.to_vec(),
            element: element.to_vec(),
        };
        self.last_commit = Some(commit.clone());
        Ok(commit)
    }

    /// Resend our commit carrying the token the responder asked for
    pub fn retry_with_token(&mut self, token: Vec<u8>) -> Result<SaeCommit> {
        if self.state != SaeState::Committed {
            return Err(self.invalid("SAE token retry"));
        }
        self.token = Some(token);
        self.commit_message()
    }

    /// Process the peer's commit
    ///
    /// A group we do not support, or one other than the group we already
    /// committed to, is refused before any secret is derived.
    pub fn process_peer_commit<R: RngCore + CryptoRng + ?Sized>(
        &mut self,
        msg: &SaeCommit,
        rng: &mut R,
    ) -> Result<CommitOutcome> {
        if msg.group != GROUP_19 || !self.params.groups.contains(&msg.group) {
            warn!(peer = %self.peer, group = msg.group, "SAE commit with unsupported group");
            return Ok(CommitOutcome::Reject(StatusCode::UnsupportedFiniteCyclicGroup));
        }
        if msg.h2e != self.uses_h2e() {
            warn!(peer = %self.peer, h2e = msg.h2e, "SAE password element method mismatch");
            return Ok(CommitOutcome::Reject(StatusCode::Unspecified));
        }

        let own_commit = match self.state {
            SaeState::Nothing => Some(self.commit(rng)?),
            SaeState::Committed => None,
            SaeState::Confirmed => {
                // Our commit or confirm was lost: answer the same commit again
                let same = self.peer_commit.as_ref().map_or(false, |c| {
                    c.scalar == msg.scalar && c.element == msg.element
                });
                if !same {
                    return Err(HandshakeError::UnexpectedMessage {
                        message: "SAE commit",
                        state: self.state.name(),
                    });
                }
                let confirm = self.next_confirm()?;
                return Ok(CommitOutcome::Accept {
                    commit: self.last_commit.clone(),
                    confirm,
                });
            }
            SaeState::Accepted => return Err(self.invalid("SAE peer commit")),
        };

        let peer_scalar = decode_scalar(&msg.scalar)?;
        let peer_element = decode_element(&msg.element)?;

        let (own_scalar, own_element, pwe) = match (&self.own_scalar, &self.own_element, &self.pwe) {
            (Some(s), Some(e), Some(p)) => (*s, *e, *p),
            _ => return Err(self.invalid("SAE peer commit")),
        };
        if peer_scalar == own_scalar && peer_element == own_element {
            return Err(HandshakeError::SaeCommitRejected("reflected commit".to_string()));
        }

        let rand = self
            .rand
            .as_ref()
            .map(|r| **r)
            .ok_or_else(|| self.invalid("SAE peer commit"))?;
        let shared = (pwe * peer_scalar + peer_element) * rand;
        let k = x_coordinate(&shared)?;

        let keyseed = Zeroizing::new(mac_over::<HmacSha256>(&[0u8; 32], &[&k[..]])?);
        let context = encode_scalar(&(own_scalar + peer_scalar));
        let kck_pmk = KdfSha256.derive(&keyseed, "SAE KCK and PMK", &context, 64)?;

        let mut pmkid = [0u8; 16];
        pmkid.copy_from_slice(&context[..16]);
        self.kck = Some(Zeroizing::new(kck_pmk[..32].to_vec()));
        self.keys = Some(SaeKeys {
            pmk: Pmk::new(&kck_pmk[32..])?,
            pmkid: Pmkid(pmkid),
        });
        self.peer_scalar = Some(peer_scalar);
        self.peer_element = Some(peer_element);
        self.peer_commit = Some(msg.clone());
        self.state = SaeState::Confirmed;
        self.sync = 0;

        let confirm = self.next_confirm()?;
        Ok(CommitOutcome::Accept {
            commit: own_commit,
            confirm,
        })
    }

    fn confirm_value(
        &self,
        send_confirm: u16,
        first: (&Scalar, &ProjectivePoint),
        second: (&Scalar, &ProjectivePoint),
    ) -> Result<[u8; 32]> {
        let kck = self.kck.as_ref().ok_or_else(|| self.invalid("SAE confirm"))?;
        let mac = mac_over::<HmacSha256>(
            kck,
            &[
                &send_confirm.to_le_bytes(),
                &encode_scalar(first.0),
                &encode_scalar(second.0),
                &encode_element(first.1)?,
                &encode_element(second.1)?,
            ],
        )?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac);
        Ok(out)
    }

    fn next_confirm(&mut self) -> Result<SaeConfirm> {
        let (own_scalar, own_element, peer_scalar, peer_element) = match (
            &self.own_scalar,
            &self.own_element,
            &self.peer_scalar,
            &self.peer_element,
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (*a, *b, *c, *d),
            _ => return Err(self.invalid("SAE confirm")),
        };
        let send_confirm = self.send_confirm;
        let confirm = self.confirm_value(
            send_confirm,
            (&own_scalar, &own_element),
            (&peer_scalar, &peer_element),
        )?;
        self.send_confirm = self.send_confirm.saturating_add(1);
        Ok(SaeConfirm {
            send_confirm,
            confirm,
        })
    }

    /// Verify the peer's confirm and release the keys
    pub fn confirm(&mut self, msg: &SaeConfirm) -> Result<SaeKeys> {
        if self.state != SaeState::Confirmed {
            return Err(self.invalid("SAE confirm"));
        }
        let (own_scalar, own_element, peer_scalar, peer_element) = match (
            &self.own_scalar,
            &self.own_element,
            &self.peer_scalar,
            &self.peer_element,
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (*a, *b, *c, *d),
            _ => return Err(self.invalid("SAE confirm")),
        };
        let expected = self.confirm_value(
            msg.send_confirm,
            (&peer_scalar, &peer_element),
            (&own_scalar, &own_element),
        )?;
        if !bool::from(expected[..].ct_eq(&msg.confirm[..])) {
            return Err(HandshakeError::SaeConfirmFailure);
        }

        let keys = self.keys.clone().ok_or_else(|| self.invalid("SAE confirm"))?;
        self.state = SaeState::Accepted;
        self.rand = None;
        self.kck = None;
        info!(peer = %self.peer, pmkid = %keys.pmkid, "SAE exchange accepted");
        Ok(keys)
    }

    /// Retransmission timer fired: resend what the peer is waiting for
    pub fn on_timeout(&mut self) -> Result<Option<SaeMessage>> {
        if matches!(self.state, SaeState::Nothing | SaeState::Accepted) {
            return Ok(None);
        }
        if self.sync >= self.params.sync_max {
            return Err(HandshakeError::RetryExhausted);
        }
        let pending = match self.state {
            SaeState::Confirmed => Some(SaeMessage::Confirm(self.next_confirm()?)),
            _ => self.last_commit.clone().map(SaeMessage::Commit),
        };
        self.sync += 1;
        debug!(peer = %self.peer, sync = self.sync, state = self.state.name(), "SAE retransmit");
        Ok(pending)
    }
}

/// Responder-side admission of commits from peers without SAE state
pub struct SaeResponder {
    own: MacAddr,
    password: Zeroizing<Vec<u8>>,
    ssid: Vec<u8>,
    params: SaeParams,
    h2e: H2eMode,
    gate: AntiClogging,
}

impl SaeResponder {
    pub fn new<R: RngCore + CryptoRng + ?Sized>(
        own: MacAddr,
        password: &[u8],
        ssid: &[u8],
        params: SaeParams,
        anti_clogging_threshold: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            own,
            password: Zeroizing::new(password.to_vec()),
            ssid: ssid.to_vec(),
            h2e: match params.pwe {
                PweMethod::HashToElement => H2eMode::Required,
                PweMethod::HuntingAndPecking => H2eMode::Disabled,
            },
            params,
            gate: AntiClogging::new(rng, anti_clogging_threshold),
        }
    }

    /// Accept the password element methods `mode` allows instead of only
    /// the one in the params
    pub fn with_h2e(mut self, mode: H2eMode) -> Self {
        self.h2e = mode;
        self
    }

    /// Handle a first commit from `peer`
    ///
    /// The anti-clogging check and the group check both happen before an
    /// exchange is allocated. `pending` is the number of peers that already
    /// hold SAE state.
    pub fn on_commit<R: RngCore + CryptoRng + ?Sized>(
        &self,
        peer: MacAddr,
        pending: usize,
        msg: &SaeCommit,
        rng: &mut R,
    ) -> Result<(Option<SaeExchange>, CommitOutcome)> {
        if let Err(HandshakeError::AntiCloggingRequired) =
            self.gate.admit(peer, pending, msg.token.as_deref())
        {
            debug!(peer = %peer, pending, "SAE anti-clogging token requested");
            return Ok((None, CommitOutcome::RequestToken(self.gate.token_for(peer)?)));
        }
        if msg.group != GROUP_19 || !self.params.groups.contains(&msg.group) {
            warn!(peer = %peer, group = msg.group, "SAE commit with unsupported group");
            return Ok((None, CommitOutcome::Reject(StatusCode::UnsupportedFiniteCyclicGroup)));
        }
        let mut params = self.params.clone();
        params.pwe = match self.h2e {
            H2eMode::Enabled => self.h2e.method_for(msg.h2e),
            H2eMode::Disabled => PweMethod::HuntingAndPecking,
            H2eMode::Required => PweMethod::HashToElement,
        };
        let mut exchange = SaeExchange::new(self.own, peer, &self.password, &self.ssid, params);
        let outcome = exchange.process_peer_commit(msg, rng)?;
        Ok((Some(exchange), outcome))
    }
}
