use bytes::Bytes;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{same_ie, Action, HandshakeState, InstalledKeys, Session};
use crate::eapol::kde::{KeyData, KeyDataBuilder};
use crate::eapol::key_info::KeyType;
use crate::eapol::{build_key_frame, verify_mic, FrameParams, KeyFrame, MessageKind};
use crate::error::{HandshakeError, Result};
use crate::group::GroupKeyContext;
use crate::keys::derive_ptk;
use crate::types::{Role, SecureRng};

/// EAPOL key IV for RC4 key data, unique per replay counter
fn rc4_iv(counter: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

impl Session {
    pub(super) fn authenticator_receive(
        &mut self,
        raw: &[u8],
        frame: &KeyFrame,
        group: Option<&GroupKeyContext>,
    ) -> Result<Vec<Action>> {
        match frame.message_kind()? {
            MessageKind::PairwiseMsg2 => self.on_msg2(raw, frame, group),
            MessageKind::PairwiseMsg4 => self.on_msg4(raw, frame, group),
            MessageKind::GroupMsg2 => self.on_group_msg2(raw, frame),
            MessageKind::Request => self.on_request(raw, frame),
            _ => Err(self.unexpected(frame)),
        }
    }

    /// Fresh ANonce and message 1; used by `begin` and pairwise rekeys
    pub(super) fn send_msg1(&mut self, rng: &mut dyn SecureRng) -> Result<Vec<Action>> {
        rng.fill_bytes(&mut self.anonce);
        self.tptk = None;
        self.in_group = false;

        let key_data = match self.pmkid {
            Some(pmkid) if !self.suite.is_legacy_wpa() => KeyDataBuilder::new().pmkid(&pmkid).finish(),
            _ => Zeroizing::new(Vec::new()),
        };
        let counter = self.replay.next_counter();
        let msg1 = build_key_frame(
            &self.suite,
            MessageKind::PairwiseMsg1,
            &FrameParams {
                replay_counter: counter,
                nonce: self.anonce,
                key_data: &key_data,
                ..Default::default()
            },
            None,
        )?;
        self.state = HandshakeState::PtkStart;
        debug!("Sending message 1/4 to {} (replay {})", self.peer, counter);
        Ok(self.transmit(msg1))
    }

    /// Authenticator: run a fresh 4-way handshake under the same PMK. The
    /// installed PTK stays in use until the new one is confirmed.
    pub fn rekey_ptk(&mut self, rng: &mut dyn SecureRng) -> Result<Vec<Action>> {
        if self.role != Role::Authenticator
            || !matches!(
                self.state,
                HandshakeState::PtkInitDone | HandshakeState::RekeyEstablished
            )
        {
            return Err(HandshakeError::InvalidState {
                operation: "pairwise rekey",
                state: self.state.name(),
            });
        }
        info!("Pairwise rekey with {}", self.peer);
        let mut actions = vec![Action::Started { rekey: true }];
        actions.extend(self.send_msg1(rng)?);
        Ok(actions)
    }

    fn on_msg2(
        &mut self,
        raw: &[u8],
        frame: &KeyFrame,
        group: Option<&GroupKeyContext>,
    ) -> Result<Vec<Action>> {
        if self.state != HandshakeState::PtkStart {
            return Err(self.unexpected(frame));
        }
        self.replay.check_reply(frame.replay_counter)?;
        let pmk = self.pmk.as_ref().ok_or(HandshakeError::InvalidState {
            operation: "derive PTK",
            state: "no PMK",
        })?;
        let ptk = derive_ptk(pmk, self.own, self.peer, &self.anonce, &frame.nonce, &self.suite)?;
        verify_mic(&self.suite, ptk.kck(), raw)?;

        let key_data = KeyData::parse(&frame.key_data)?;
        if !same_ie(key_data.rsne(), &self.peer_ie) || key_data.rsnxe() != self.peer_rsnxe.as_deref() {
            warn!("Element in message 2/4 from {} differs from association", self.peer);
            return Err(HandshakeError::IeMismatch);
        }
        let group = group.ok_or(HandshakeError::InvalidState {
            operation: "build message 3/4",
            state: "no group keys",
        })?;

        self.replay.consume_reply();
        self.snonce = frame.nonce;
        self.tptk = Some(ptk);

        let msg3 = self.build_msg3(group)?;
        self.state = HandshakeState::PtkInitNegotiating;
        Ok(self.transmit(msg3))
    }

    fn build_msg3(&mut self, group: &GroupKeyContext) -> Result<Bytes> {
        let legacy = self.suite.is_legacy_wpa();
        let mut builder = KeyDataBuilder::new().element(group.ie());
        if let Some(rsnxe) = group.rsnxe() {
            builder = builder.element(rsnxe);
        }
        let mut key_data = builder.finish();
        // WPA delivers the GTK in a separate group handshake
        if !legacy {
            key_data.extend_from_slice(&group.key_data(false));
        }

        let counter = self.replay.next_counter();
        debug!("Sending message 3/4 to {} (replay {})", self.peer, counter);
        build_key_frame(
            &self.suite,
            MessageKind::PairwiseMsg3,
            &FrameParams {
                replay_counter: counter,
                nonce: self.anonce,
                key_data: &key_data,
                ..Default::default()
            },
            self.tptk.as_ref(),
        )
    }

    fn on_msg4(
        &mut self,
        raw: &[u8],
        frame: &KeyFrame,
        group: Option<&GroupKeyContext>,
    ) -> Result<Vec<Action>> {
        if self.state != HandshakeState::PtkInitNegotiating {
            return Err(self.unexpected(frame));
        }
        self.replay.check_reply(frame.replay_counter)?;
        let tptk = self.tptk.as_ref().ok_or(HandshakeError::InvalidState {
            operation: "verify message 4/4",
            state: self.state.name(),
        })?;
        verify_mic(&self.suite, tptk.kck(), raw)?;
        self.replay.consume_reply();

        self.ptk = self.tptk.take();
        self.state = HandshakeState::PtkInitDone;
        self.last_sent = None;
        info!("Pairwise keys installed for {} ({})", self.peer, self.suite.akm);

        let mut actions = vec![Action::CancelTimer];
        if let Some(ptk) = &self.ptk {
            actions.push(Action::Complete(InstalledKeys {
                ptk: ptk.clone(),
                gtk: None,
                igtk: None,
            }));
        }
        if self.suite.is_legacy_wpa() {
            if let Some(group) = group {
                actions.extend(self.start_group_rekey(group)?);
            }
        }
        Ok(actions)
    }

    /// Authenticator: send group message 1 carrying the current GTK/IGTK
    ///
    /// Valid once the pairwise keys are installed. A group handshake that
    /// is still outstanding is superseded.
    pub fn start_group_rekey(&mut self, group: &GroupKeyContext) -> Result<Vec<Action>> {
        if self.role != Role::Authenticator
            || !matches!(
                self.state,
                HandshakeState::PtkInitDone
                    | HandshakeState::RekeyNegotiating
                    | HandshakeState::RekeyEstablished
            )
        {
            return Err(HandshakeError::InvalidState {
                operation: "group rekey",
                state: self.state.name(),
            });
        }
        let legacy = self.suite.is_legacy_wpa();
        let key_data = group.key_data(legacy);
        let counter = self.replay.next_counter();
        let msg = build_key_frame(
            &self.suite,
            MessageKind::GroupMsg1,
            &FrameParams {
                replay_counter: counter,
                key_data: &key_data,
                iv: rc4_iv(counter),
                key_index: group.gtk().index,
                ..Default::default()
            },
            Some(self.installed_ptk("group rekey")?),
        )?;
        self.state = HandshakeState::RekeyNegotiating;
        self.in_group = true;
        debug!(
            "Sending group message 1/2 to {} (GTK index {}, replay {})",
            self.peer,
            group.gtk().index,
            counter
        );
        Ok(self.transmit(msg))
    }

    fn on_group_msg2(&mut self, raw: &[u8], frame: &KeyFrame) -> Result<Vec<Action>> {
        if self.state != HandshakeState::RekeyNegotiating {
            return Err(self.unexpected(frame));
        }
        self.replay.check_reply(frame.replay_counter)?;
        verify_mic(&self.suite, self.installed_ptk("verify group message 2/2")?.kck(), raw)?;
        self.replay.consume_reply();

        self.state = HandshakeState::RekeyEstablished;
        self.last_sent = None;
        debug!("{} acknowledged the group keys", self.peer);
        Ok(vec![Action::CancelTimer, Action::GroupRekeyComplete])
    }

    fn on_request(&mut self, raw: &[u8], frame: &KeyFrame) -> Result<Vec<Action>> {
        let ptk = match &self.ptk {
            Some(ptk) => ptk,
            None => return Err(self.unexpected(frame)),
        };
        verify_mic(&self.suite, ptk.kck(), raw)?;
        self.replay.accept_request(frame.replay_counter)?;

        let info = &frame.key_info;
        if info.error {
            self.mic_failures += 1;
            warn!(
                "{} reported a Michael MIC failure ({} so far)",
                self.peer, self.mic_failures
            );
            return Ok(vec![Action::MicFailureReported {
                count: self.mic_failures,
            }]);
        }
        if info.key_type == KeyType::Pairwise {
            info!("{} requested a pairwise rekey", self.peer);
            Ok(vec![Action::PairwiseRekeyRequested])
        } else {
            info!("{} requested a group rekey", self.peer);
            Ok(vec![Action::GroupRekeyRequested])
        }
    }
}
