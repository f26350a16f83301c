//! 4-way and group key handshake state machine
//!
//! A `Session` is sans-IO: it consumes raw EAPOL-Key frames and timer
//! expiries and answers with a list of `Action`s for its owner to carry
//! out (send a frame, arm or cancel the resend timer, install keys, report
//! status). The same type runs both roles; `authenticator` and
//! `supplicant` hold the per-role message handlers.

mod authenticator;
mod supplicant;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::eapol::rsne::Rsne;
use crate::eapol::KeyFrame;
use crate::error::{Disposition, HandshakeError, ReasonCode, Result};
use crate::governor::{ReplayState, RetryBudget, RetryDecision, RetryPolicy};
use crate::group::GroupKeyContext;
use crate::keys::{Gtk, Igtk, Pmk, Ptk};
use crate::suite::CipherSuite;
use crate::types::{MacAddr, Nonce, Pmkid, Role, SecureRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    PtkStart,
    PtkInitNegotiating,
    PtkInitDone,
    RekeyNegotiating,
    RekeyEstablished,
    KeyError,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "IDLE",
            HandshakeState::PtkStart => "PTKSTART",
            HandshakeState::PtkInitNegotiating => "PTKINITNEGOTIATING",
            HandshakeState::PtkInitDone => "PTKINITDONE",
            HandshakeState::RekeyNegotiating => "REKEYNEGOTIATING",
            HandshakeState::RekeyEstablished => "REKEYESTABLISHED",
            HandshakeState::KeyError => "KEYERROR",
        }
    }

    /// States in which a resend timer is outstanding
    fn awaits_reply(&self) -> bool {
        matches!(
            self,
            HandshakeState::PtkStart
                | HandshakeState::PtkInitNegotiating
                | HandshakeState::RekeyNegotiating
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Keys handed to the data path when a pairwise handshake completes
#[derive(Debug, Clone)]
pub struct InstalledKeys {
    pub ptk: Ptk,
    /// Supplicant only: group keys delivered in message 3
    pub gtk: Option<Gtk>,
    pub igtk: Option<Igtk>,
}

/// Side effects requested by a session
#[derive(Debug, Clone)]
pub enum Action {
    /// Transmit an EAPOL-Key frame to the peer
    Send(Bytes),
    /// (Re)arm the resend timer
    ArmTimer(Duration),
    CancelTimer,
    /// A 4-way handshake began (`rekey` when keys were already installed)
    Started { rekey: bool },
    /// Pairwise keys are installed
    Complete(InstalledKeys),
    /// Supplicant: new group keys from a group handshake
    InstallGroup { gtk: Gtk, igtk: Option<Igtk> },
    /// Authenticator: the peer acknowledged the current group keys
    GroupRekeyComplete,
    /// Authenticator: the peer asked for a new GTK
    GroupRekeyRequested,
    /// Authenticator: the peer asked for a new PTK
    PairwiseRekeyRequested,
    /// Authenticator: the peer reported a Michael MIC failure
    MicFailureReported { count: u32 },
}

/// Everything fixed at association time
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub own: MacAddr,
    pub peer: MacAddr,
    pub suite: CipherSuite,
    /// Our RSN/WPA element as sent in the association request. The
    /// authenticator copies the BSS element from the group context instead.
    pub own_ie: Vec<u8>,
    pub own_rsnxe: Option<Vec<u8>>,
    /// The peer's element as seen during association: the station's
    /// association request, or the AP's beacon / probe response
    pub peer_ie: Vec<u8>,
    pub peer_rsnxe: Option<Vec<u8>>,
    pub retry: RetryPolicy,
}

/// One handshake session per associated peer
pub struct Session {
    role: Role,
    own: MacAddr,
    peer: MacAddr,
    suite: CipherSuite,
    own_ie: Vec<u8>,
    own_rsnxe: Option<Vec<u8>>,
    peer_ie: Vec<u8>,
    peer_rsnxe: Option<Vec<u8>>,

    state: HandshakeState,
    pmk: Option<Pmk>,
    pmkid: Option<Pmkid>,
    anonce: Nonce,
    snonce: Nonce,
    /// Derived but not yet confirmed by the peer
    tptk: Option<Ptk>,
    /// Installed; only set once a handshake completes
    ptk: Option<Ptk>,
    gtk: Option<Gtk>,
    igtk: Option<Igtk>,

    replay: ReplayState,
    retry: RetryBudget,
    last_sent: Option<Bytes>,
    /// Supplicant: last authenticated frame and the reply it got
    answered: Option<(Vec<u8>, Bytes)>,
    in_group: bool,
    mic_failures: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("own", &self.own)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("suite", &self.suite)
            .field("pmkid", &self.pmkid)
            .field("installed", &self.ptk.is_some())
            .finish_non_exhaustive()
    }
}

/// Compare a received RSN/WPA element with the one from association.
/// PMKID lists are ignored: message 2 may omit the PMKID the association
/// request carried.
fn same_ie(received: Option<&[u8]>, expected: &[u8]) -> bool {
    let Some(received) = received else {
        return false;
    };
    match (Rsne::parse(received), Rsne::parse(expected)) {
        (Ok(mut a), Ok(mut b)) => {
            a.pmkids.clear();
            b.pmkids.clear();
            a == b
        }
        _ => false,
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            role: config.role,
            own: config.own,
            peer: config.peer,
            suite: config.suite,
            own_ie: config.own_ie,
            own_rsnxe: config.own_rsnxe,
            peer_ie: config.peer_ie,
            peer_rsnxe: config.peer_rsnxe,
            state: HandshakeState::Idle,
            pmk: None,
            pmkid: None,
            anonce: [0u8; 32],
            snonce: [0u8; 32],
            tptk: None,
            ptk: None,
            gtk: None,
            igtk: None,
            replay: ReplayState::new(),
            retry: RetryBudget::new(config.retry),
            last_sent: None,
            answered: None,
            in_group: false,
            mic_failures: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> MacAddr {
        self.peer
    }

    pub fn own(&self) -> MacAddr {
        self.own
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    /// The installed PTK; `None` until a handshake has completed
    pub fn ptk(&self) -> Option<&Ptk> {
        self.ptk.as_ref()
    }

    pub fn gtk(&self) -> Option<&Gtk> {
        self.gtk.as_ref()
    }

    pub fn uses_pmksa(&self) -> bool {
        self.pmkid.is_some()
    }

    pub fn pmkid(&self) -> Option<Pmkid> {
        self.pmkid
    }

    pub fn mic_failures(&self) -> u32 {
        self.mic_failures
    }

    pub fn last_accepted_counter(&self) -> Option<u64> {
        self.replay.last_accepted()
    }

    /// Start the 4-way handshake from IDLE with an accepted PMK
    ///
    /// `pmkid` is set when the PMK came from the PMKSA cache (or an SAE
    /// exchange); the authenticator then names it in message 1.
    pub fn begin(
        &mut self,
        pmk: Pmk,
        pmkid: Option<Pmkid>,
        rng: &mut dyn SecureRng,
    ) -> Result<Vec<Action>> {
        if self.state != HandshakeState::Idle {
            return Err(HandshakeError::InvalidState {
                operation: "begin",
                state: self.state.name(),
            });
        }
        if pmk.len() != self.suite.akm.pmk_len() {
            return Err(HandshakeError::UnsupportedSuite(format!(
                "{} needs a {}-byte PMK",
                self.suite.akm,
                self.suite.akm.pmk_len()
            )));
        }
        self.pmk = Some(pmk);
        self.pmkid = pmkid;
        debug!(
            "{} session for {} starting (PMKSA: {})",
            self.role,
            self.peer,
            self.pmkid.is_some()
        );

        let mut actions = vec![Action::Started { rekey: false }];
        match self.role {
            Role::Authenticator => actions.extend(self.send_msg1(rng)?),
            Role::Supplicant => {
                rng.fill_bytes(&mut self.snonce);
                self.state = HandshakeState::PtkStart;
                actions.push(Action::ArmTimer(self.retry.restart()));
            }
        }
        Ok(actions)
    }

    /// Process one received EAPOL-Key frame
    ///
    /// Errors whose disposition is `Drop` leave the session exactly where
    /// it was. Any other error moves it to KEYERROR and discards the keys
    /// of the attempt; the owner deauthenticates the peer.
    pub fn on_message_received(
        &mut self,
        raw: &[u8],
        rng: &mut dyn SecureRng,
        group: Option<&GroupKeyContext>,
    ) -> Result<Vec<Action>> {
        if matches!(self.state, HandshakeState::Idle | HandshakeState::KeyError) {
            return Err(HandshakeError::UnexpectedMessage {
                message: "EAPOL-Key",
                state: self.state.name(),
            });
        }
        let result = self.receive(raw, rng, group);
        if let Err(e) = &result {
            if e.disposition() != Disposition::Drop {
                warn!("{} handshake with {} failed: {}", self.role, self.peer, e);
                self.fail();
            }
        }
        result
    }

    fn receive(
        &mut self,
        raw: &[u8],
        rng: &mut dyn SecureRng,
        group: Option<&GroupKeyContext>,
    ) -> Result<Vec<Action>> {
        if self.role == Role::Supplicant {
            if let Some((frame, reply)) = &self.answered {
                if frame.as_slice() == raw {
                    debug!("Retransmission from {}, resending reply without reinstalling", self.peer);
                    return Ok(vec![Action::Send(reply.clone())]);
                }
            }
        }
        let frame = KeyFrame::decode_for(raw, &self.suite)?;
        debug!("{} <- {}: {}", self.role, self.peer, frame);
        match self.role {
            Role::Authenticator => self.authenticator_receive(raw, &frame, group),
            Role::Supplicant => self.supplicant_receive(raw, &frame, rng),
        }
    }

    /// Resend timer expiry
    ///
    /// With budget left the last outbound message is resent unchanged (same
    /// nonce, same replay counter). Once the budget is spent the session
    /// moves to KEYERROR and `RetryExhausted` is returned.
    pub fn on_timeout(&mut self) -> Result<Vec<Action>> {
        if !self.state.awaits_reply() {
            return Ok(Vec::new());
        }
        match self.retry.on_timeout() {
            RetryDecision::Resend {
                attempt,
                next_timeout,
            } => {
                let mut actions = Vec::with_capacity(2);
                if let Some(frame) = &self.last_sent {
                    debug!(
                        "Resending to {} in {} (attempt {})",
                        self.peer, self.state, attempt
                    );
                    actions.push(Action::Send(frame.clone()));
                }
                actions.push(Action::ArmTimer(next_timeout));
                Ok(actions)
            }
            RetryDecision::Exhausted => {
                warn!(
                    "{} gave up on {} in {} after {} retries",
                    self.role,
                    self.peer,
                    self.state,
                    self.retry.policy().max_retries
                );
                self.fail();
                Err(HandshakeError::RetryExhausted)
            }
        }
    }

    /// Reason code to deauthenticate with after `error`, if any
    pub fn teardown_reason(&self, error: &HandshakeError) -> Option<ReasonCode> {
        match error.disposition() {
            Disposition::Teardown(_) if self.in_group => Some(ReasonCode::GroupKeyUpdateTimeout),
            Disposition::Abort(reason) | Disposition::Teardown(reason) => Some(reason),
            _ => None,
        }
    }

    fn fail(&mut self) {
        self.state = HandshakeState::KeyError;
        self.tptk = None;
        self.ptk = None;
        self.last_sent = None;
        self.answered = None;
    }

    /// Record an outbound message for resending and arm the timer
    fn transmit(&mut self, frame: Bytes) -> Vec<Action> {
        self.last_sent = Some(frame.clone());
        vec![Action::Send(frame), Action::ArmTimer(self.retry.restart())]
    }

    fn unexpected(&self, frame: &KeyFrame) -> HandshakeError {
        HandshakeError::UnexpectedMessage {
            message: frame
                .message_kind()
                .map(|k| k.name())
                .unwrap_or("EAPOL-Key"),
            state: self.state.name(),
        }
    }

    fn installed_ptk(&self, operation: &'static str) -> Result<&Ptk> {
        self.ptk.as_ref().ok_or(HandshakeError::InvalidState {
            operation,
            state: self.state.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eapol::kde::{KeyData, KeyDataBuilder};
    use crate::eapol::key_info::DescriptorType;
    use crate::eapol::rsne::RsnCapabilities;
    use crate::eapol::{build_key_frame, verify_mic, FrameParams, MessageKind, MIC_OFFSET};
    use crate::suite::{Akm, Cipher};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const AA: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const SPA: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

    struct Pair {
        ap: Session,
        sta: Session,
        group: GroupKeyContext,
        rng: StdRng,
    }

    fn psk_suite() -> CipherSuite {
        CipherSuite::new(
            Akm::Psk,
            Cipher::Ccmp128,
            Cipher::Ccmp128,
            None,
            DescriptorType::Rsn,
            false,
        )
        .unwrap()
    }

    fn pair_with(suite: CipherSuite, ap_ie: Vec<u8>, sta_ie: Vec<u8>) -> Pair {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let group =
            GroupKeyContext::new(AA, suite.clone(), ap_ie.clone(), None, &mut rng).unwrap();
        let ap = Session::new(SessionConfig {
            role: Role::Authenticator,
            own: AA,
            peer: SPA,
            suite: suite.clone(),
            own_ie: ap_ie.clone(),
            own_rsnxe: None,
            peer_ie: sta_ie.clone(),
            peer_rsnxe: None,
            retry: RetryPolicy::authenticator(),
        });
        let sta = Session::new(SessionConfig {
            role: Role::Supplicant,
            own: SPA,
            peer: AA,
            suite,
            own_ie: sta_ie,
            own_rsnxe: None,
            peer_ie: ap_ie,
            peer_rsnxe: None,
            retry: RetryPolicy::supplicant(),
        });
        Pair { ap, sta, group, rng }
    }

    fn psk_pair() -> Pair {
        let ie = Rsne::build(&[Akm::Psk], &[Cipher::Ccmp128], Cipher::Ccmp128, None, None).encode();
        pair_with(psk_suite(), ie.clone(), ie)
    }

    fn pmk() -> Pmk {
        Pmk::from_passphrase("password", b"IEEE").unwrap()
    }

    fn frames(actions: &[Action]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn one_frame(actions: &[Action]) -> Bytes {
        let sent = frames(actions);
        assert_eq!(sent.len(), 1, "expected one frame in {:?}", actions);
        sent[0].clone()
    }

    fn completed(actions: &[Action]) -> Option<&InstalledKeys> {
        actions.iter().find_map(|a| match a {
            Action::Complete(keys) => Some(keys),
            _ => None,
        })
    }

    impl Pair {
        fn begin(&mut self) -> Bytes {
            self.sta.begin(pmk(), None, &mut self.rng).unwrap();
            let actions = self.ap.begin(pmk(), None, &mut self.rng).unwrap();
            one_frame(&actions)
        }

        fn ap_rx(&mut self, raw: &[u8]) -> Result<Vec<Action>> {
            self.ap.on_message_received(raw, &mut self.rng, Some(&self.group))
        }

        fn sta_rx(&mut self, raw: &[u8]) -> Result<Vec<Action>> {
            self.sta.on_message_received(raw, &mut self.rng, None)
        }

        /// Run the 4-way handshake, returning (msg1, msg2, msg3, msg4)
        fn run(&mut self) -> [Bytes; 4] {
            let msg1 = self.begin();
            let msg2 = one_frame(&self.sta_rx(&msg1).unwrap());
            let msg3 = one_frame(&self.ap_rx(&msg2).unwrap());
            let msg4 = one_frame(&self.sta_rx(&msg3).unwrap());
            self.ap_rx(&msg4).unwrap();
            [msg1, msg2, msg3, msg4]
        }
    }

    #[test]
    fn test_wpa2_psk_end_to_end_then_group_rekey() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        assert_eq!(p.ap.state(), HandshakeState::PtkStart);

        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        assert_eq!(p.sta.state(), HandshakeState::PtkInitNegotiating);

        let actions = p.ap_rx(&msg2).unwrap();
        assert_eq!(p.ap.state(), HandshakeState::PtkInitNegotiating);
        let msg3 = one_frame(&actions);

        let actions = p.sta_rx(&msg3).unwrap();
        let sta_keys = completed(&actions).expect("supplicant installs keys");
        assert_eq!(sta_keys.gtk.as_ref().unwrap(), p.group.gtk());
        let msg4 = one_frame(&actions);

        let actions = p.ap_rx(&msg4).unwrap();
        assert_eq!(p.ap.state(), HandshakeState::PtkInitDone);
        assert_eq!(p.sta.state(), HandshakeState::PtkInitDone);
        assert!(completed(&actions).is_some());
        assert_eq!(p.ap.ptk(), p.sta.ptk());

        let msg3_counter = KeyFrame::decode(&msg3, 16).unwrap().replay_counter;
        p.group.begin_rekey([SPA]).unwrap();
        let gmsg1 = one_frame(&p.ap.start_group_rekey(&p.group).unwrap());
        let frame = KeyFrame::decode(&gmsg1, 16).unwrap();
        assert!(frame.replay_counter > msg3_counter);
        assert!(frame.key_info.secure);
        assert_eq!(p.ap.state(), HandshakeState::RekeyNegotiating);

        let actions = p.sta_rx(&gmsg1).unwrap();
        let installed = actions.iter().any(|a| {
            matches!(a, Action::InstallGroup { gtk, .. } if gtk == p.group.gtk())
        });
        assert!(installed);
        let gmsg2 = one_frame(&actions);

        let actions = p.ap_rx(&gmsg2).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::GroupRekeyComplete)));
        assert_eq!(p.ap.state(), HandshakeState::RekeyEstablished);
    }

    #[test]
    fn test_ptk_unreadable_until_installed() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        assert!(p.sta.ptk().is_none());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());
        assert!(p.ap.ptk().is_none());
        let msg4 = one_frame(&p.sta_rx(&msg3).unwrap());
        assert!(p.sta.ptk().is_some());
        assert!(p.ap.ptk().is_none());
        p.ap_rx(&msg4).unwrap();
        assert!(p.ap.ptk().is_some());
    }

    #[test]
    fn test_any_bit_flip_in_message2_is_rejected() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());

        for byte in 0..msg2.len() {
            if (MIC_OFFSET..MIC_OFFSET + 16).contains(&byte) {
                continue;
            }
            for bit in 0..8 {
                let mut bad = msg2.to_vec();
                bad[byte] ^= 1 << bit;
                assert!(p.ap_rx(&bad).is_err(), "flip at byte {} bit {} accepted", byte, bit);
                assert_eq!(p.ap.state(), HandshakeState::PtkStart);
            }
        }
        assert!(p.ap_rx(&msg2).is_ok());
    }

    #[test]
    fn test_accepted_replay_counters_strictly_increase() {
        let mut p = psk_pair();
        let [msg1, _, msg3, _] = p.run();
        let mut seen = vec![p.sta.last_accepted_counter().unwrap()];

        for _ in 0..3 {
            p.group.begin_rekey([SPA]).unwrap();
            let gmsg1 = one_frame(&p.ap.start_group_rekey(&p.group).unwrap());
            let gmsg2 = one_frame(&p.sta_rx(&gmsg1).unwrap());
            p.ap_rx(&gmsg2).unwrap();
            seen.push(p.sta.last_accepted_counter().unwrap());
        }
        assert!(seen.windows(2).all(|w| w[1] > w[0]), "{:?}", seen);

        // Older frames are replays now
        assert!(matches!(
            p.sta_rx(&msg1),
            Err(HandshakeError::ReplayViolation { .. })
        ));
        let mut stale = msg3.to_vec();
        stale[MIC_OFFSET + 15] ^= 1;
        assert!(p.sta_rx(&stale).is_err());
        assert_eq!(p.sta.state(), HandshakeState::RekeyEstablished);
    }

    #[test]
    fn test_retry_budget_is_exact() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        for attempt in 1..=RetryPolicy::AUTHENTICATOR_RETRIES {
            let actions = p.ap.on_timeout().unwrap();
            assert_eq!(one_frame(&actions), msg1, "attempt {} resends message 1", attempt);
            assert_eq!(p.ap.state(), HandshakeState::PtkStart);
        }
        let err = p.ap.on_timeout().unwrap_err();
        assert_eq!(err, HandshakeError::RetryExhausted);
        assert_eq!(p.ap.state(), HandshakeState::KeyError);
        assert_eq!(
            p.ap.teardown_reason(&err),
            Some(ReasonCode::FourWayHandshakeTimeout)
        );

        for _ in 0..RetryPolicy::SUPPLICANT_RETRIES {
            assert!(p.sta.on_timeout().is_ok());
        }
        assert!(p.sta.on_timeout().is_err());
    }

    #[test]
    fn test_group_timeout_uses_group_reason() {
        let mut p = psk_pair();
        p.run();
        p.ap.start_group_rekey(&p.group).unwrap();
        for _ in 0..RetryPolicy::AUTHENTICATOR_RETRIES {
            p.ap.on_timeout().unwrap();
        }
        let err = p.ap.on_timeout().unwrap_err();
        assert_eq!(p.ap.teardown_reason(&err), Some(ReasonCode::GroupKeyUpdateTimeout));
    }

    #[test]
    fn test_message3_retransmission_does_not_reinstall() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());
        let first = p.sta_rx(&msg3).unwrap();
        assert!(completed(&first).is_some());

        // AP missed message 4 and resends message 3
        let resent = one_frame(&p.ap.on_timeout().unwrap());
        assert_eq!(resent, msg3);
        let again = p.sta_rx(&resent).unwrap();
        assert!(completed(&again).is_none());
        assert_eq!(one_frame(&again), one_frame(&first));

        p.ap_rx(&one_frame(&again)).unwrap();
        assert_eq!(p.ap.state(), HandshakeState::PtkInitDone);
    }

    #[test]
    fn test_message1_retransmission_reuses_snonce() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let first = one_frame(&p.sta_rx(&msg1).unwrap());
        let resent = one_frame(&p.ap.on_timeout().unwrap());
        let second = one_frame(&p.sta_rx(&resent).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_ie_mismatch_aborts_with_reason_17() {
        let ap_ie =
            Rsne::build(&[Akm::Psk], &[Cipher::Ccmp128], Cipher::Ccmp128, None, None).encode();
        let assoc_ie = ap_ie.clone();
        let mut p = pair_with(psk_suite(), ap_ie, assoc_ie);
        // The station's message 2 advertises something other than what
        // the association request did
        p.sta.own_ie = Rsne::build(
            &[Akm::Psk],
            &[Cipher::Ccmp128, Cipher::Tkip],
            Cipher::Ccmp128,
            None,
            None,
        )
        .encode();

        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let err = p.ap_rx(&msg2).unwrap_err();
        assert_eq!(err, HandshakeError::IeMismatch);
        assert_eq!(p.ap.state(), HandshakeState::KeyError);
        assert_eq!(p.ap.teardown_reason(&err), Some(ReasonCode::IeInFourWayDiffers));
        assert!(p.ap.ptk().is_none());
    }

    #[test]
    fn test_undecryptable_key_data_aborts() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());

        let kck = p.ap.tptk.as_ref().unwrap().kck().to_vec();
        let mut frame = KeyFrame::decode(&msg3, 16).unwrap();
        frame.key_data = vec![0x5a; 32];
        frame.mic = vec![0u8; 16];
        frame.mic = p.ap.suite.mic().compute(&kck, &frame.encode()).unwrap();
        let forged = frame.encode();
        assert!(verify_mic(&p.ap.suite, &kck, &forged).is_ok());

        let err = p.sta_rx(&forged).unwrap_err();
        assert_eq!(err, HandshakeError::KeyDataDecryptFailure);
        assert_eq!(p.sta.state(), HandshakeState::KeyError);
        assert!(p.sta.ptk().is_none());
    }

    #[test]
    fn test_wrongly_sized_gtk_in_message3_is_not_installed() {
        let mut p = psk_pair();
        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        p.ap_rx(&msg2).unwrap();

        let key_data = KeyDataBuilder::new()
            .element(p.group.ie())
            .gtk(1, true, &[0x77u8; 5])
            .finish();
        let counter = p.ap.replay.next_counter();
        let forged = build_key_frame(
            &p.ap.suite,
            MessageKind::PairwiseMsg3,
            &FrameParams {
                replay_counter: counter,
                nonce: p.ap.anonce,
                key_data: &key_data,
                ..Default::default()
            },
            p.ap.tptk.as_ref(),
        )
        .unwrap();

        let err = p.sta_rx(&forged).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedFrame(_)), "{:?}", err);
        assert!(p.sta.ptk().is_none());
    }

    #[test]
    fn test_group_message1_key_lengths_are_checked() {
        let mut p = psk_pair();
        p.run();

        let short = KeyDataBuilder::new().gtk(2, true, &[0x55u8; 32]).finish();
        let counter = p.ap.replay.next_counter();
        let forged = build_key_frame(
            &p.ap.suite,
            MessageKind::GroupMsg1,
            &FrameParams {
                replay_counter: counter,
                key_data: &short,
                ..Default::default()
            },
            p.ap.ptk.as_ref(),
        )
        .unwrap();
        let err = p.sta_rx(&forged).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedFrame(_)), "{:?}", err);
        assert_eq!(p.sta.gtk(), Some(p.group.gtk()));

        // No management cipher negotiated: a stray IGTK is not installed
        let with_igtk = KeyDataBuilder::new()
            .gtk(2, true, &[0x55u8; 16])
            .igtk(4, 1, &[0x66u8; 16])
            .finish();
        let counter = p.ap.replay.next_counter();
        let gmsg1 = build_key_frame(
            &p.ap.suite,
            MessageKind::GroupMsg1,
            &FrameParams {
                replay_counter: counter,
                key_data: &with_igtk,
                ..Default::default()
            },
            p.ap.ptk.as_ref(),
        )
        .unwrap();
        let actions = p.sta_rx(&gmsg1).unwrap();
        let installed = actions.iter().any(|a| {
            matches!(a, Action::InstallGroup { gtk, igtk: None } if gtk.index == 2)
        });
        assert!(installed, "{:?}", actions);
    }

    #[test]
    fn test_begin_only_from_idle() {
        let mut p = psk_pair();
        p.begin();
        let err = p.ap.begin(pmk(), None, &mut p.rng).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidState { .. }));
    }

    #[test]
    fn test_pmksa_pmkid_travels_in_message1() {
        let mut p = psk_pair();
        let pmkid = pmk().pmkid(AA, SPA, Akm::Psk).unwrap();
        p.sta.begin(pmk(), Some(pmkid), &mut p.rng).unwrap();
        let msg1 = one_frame(&p.ap.begin(pmk(), Some(pmkid), &mut p.rng).unwrap());
        let frame = KeyFrame::decode(&msg1, 16).unwrap();
        assert_eq!(KeyData::parse(&frame.key_data).unwrap().pmkid(), Some(pmkid));
        assert!(p.ap.uses_pmksa());
        assert!(p.sta_rx(&msg1).is_ok());
    }

    #[test]
    fn test_pmkid_mismatch_in_message1_is_dropped() {
        let mut p = psk_pair();
        p.sta.begin(pmk(), Some(Pmkid([1; 16])), &mut p.rng).unwrap();
        let msg1 = one_frame(&p.ap.begin(pmk(), Some(Pmkid([2; 16])), &mut p.rng).unwrap());
        assert!(p.sta_rx(&msg1).is_err());
        assert_eq!(p.sta.state(), HandshakeState::PtkStart);
    }

    #[test]
    fn test_requests_and_mic_failure_reports() {
        let mut p = psk_pair();
        p.run();

        let req = one_frame(&p.sta.request_rekey(false).unwrap());
        let actions = p.ap_rx(&req).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::GroupRekeyRequested)));
        assert!(matches!(p.ap_rx(&req), Err(HandshakeError::ReplayViolation { .. })));

        let report = one_frame(&p.sta.report_mic_failure().unwrap());
        let actions = p.ap_rx(&report).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::MicFailureReported { count: 1 })));
        assert_eq!(p.ap.mic_failures(), 1);

        let req = one_frame(&p.sta.request_rekey(true).unwrap());
        let actions = p.ap_rx(&req).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::PairwiseRekeyRequested)));
    }

    #[test]
    fn test_pairwise_rekey_replaces_ptk() {
        let mut p = psk_pair();
        p.run();
        let old = p.ap.ptk().cloned().unwrap();

        let actions = p.ap.rekey_ptk(&mut p.rng).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::Started { rekey: true })));
        // Old keys stay in use until the new ones are installed
        assert_eq!(p.ap.ptk(), Some(&old));
        let msg1 = one_frame(&actions);
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());
        let msg4 = one_frame(&p.sta_rx(&msg3).unwrap());
        p.ap_rx(&msg4).unwrap();
        assert_ne!(p.ap.ptk(), Some(&old));
        assert_eq!(p.ap.ptk(), p.sta.ptk());
    }

    #[test]
    fn test_sae_suite_delivers_igtk() {
        let caps = Some(RsnCapabilities::default().with_mfpc(true).with_mfpr(true));
        let ie = Rsne::build(
            &[Akm::Sae],
            &[Cipher::Ccmp128],
            Cipher::Ccmp128,
            caps,
            Some(Cipher::BipCmac128),
        )
        .encode();
        let suite = CipherSuite::new(
            Akm::Sae,
            Cipher::Ccmp128,
            Cipher::Ccmp128,
            Some(Cipher::BipCmac128),
            DescriptorType::Rsn,
            false,
        )
        .unwrap();
        let mut p = pair_with(suite, ie.clone(), ie);
        let sae_pmk = Pmk::new(&[0x3c; 32]).unwrap();

        p.sta.begin(sae_pmk.clone(), None, &mut p.rng).unwrap();
        let msg1 = one_frame(&p.ap.begin(sae_pmk, None, &mut p.rng).unwrap());
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());
        let actions = p.sta_rx(&msg3).unwrap();
        let keys = completed(&actions).unwrap();
        assert_eq!(keys.igtk.as_ref().unwrap().key(), p.group.igtk().unwrap().key());
        p.ap_rx(&one_frame(&actions)).unwrap();
        assert_eq!(p.ap.state(), HandshakeState::PtkInitDone);
    }

    #[test]
    fn test_legacy_wpa_tkip_with_rc4_group_key() {
        let suite = CipherSuite::new(
            Akm::Psk,
            Cipher::Tkip,
            Cipher::Tkip,
            None,
            DescriptorType::Wpa,
            true,
        )
        .unwrap();
        let ie = Rsne::build_wpa(&[Akm::Psk], &[Cipher::Tkip], Cipher::Tkip).encode();
        let mut p = pair_with(suite, ie.clone(), ie);

        let msg1 = p.begin();
        let msg2 = one_frame(&p.sta_rx(&msg1).unwrap());
        let msg3 = one_frame(&p.ap_rx(&msg2).unwrap());
        let actions = p.sta_rx(&msg3).unwrap();
        assert!(completed(&actions).unwrap().gtk.is_none());
        let msg4 = one_frame(&actions);

        // Message 4 chains straight into the group handshake
        let actions = p.ap_rx(&msg4).unwrap();
        assert!(completed(&actions).is_some());
        let gmsg1 = one_frame(&actions);
        assert_eq!(p.ap.state(), HandshakeState::RekeyNegotiating);

        let actions = p.sta_rx(&gmsg1).unwrap();
        let gtk = actions
            .iter()
            .find_map(|a| match a {
                Action::InstallGroup { gtk, .. } => Some(gtk.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(gtk.key(), p.group.gtk().key());
        p.ap_rx(&one_frame(&actions)).unwrap();
        assert_eq!(p.ap.state(), HandshakeState::RekeyEstablished);
    }
}
