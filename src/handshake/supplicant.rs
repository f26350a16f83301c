use tracing::{debug, info, warn};

use super::{same_ie, Action, HandshakeState, InstalledKeys, Session};
use crate::eapol::kde::{GtkKde, IgtkKde, KeyData, KeyDataBuilder};
use crate::eapol::{build_key_frame, decrypt_key_data, verify_mic, FrameParams, KeyFrame, MessageKind};
use crate::error::{HandshakeError, Result};
use crate::keys::{derive_ptk, Gtk, Igtk};
use crate::types::{Role, SecureRng};

impl Session {
    pub(super) fn supplicant_receive(
        &mut self,
        raw: &[u8],
        frame: &KeyFrame,
        rng: &mut dyn SecureRng,
    ) -> Result<Vec<Action>> {
        match frame.message_kind()? {
            MessageKind::PairwiseMsg1 => self.on_msg1(frame, rng),
            MessageKind::PairwiseMsg3 => self.on_msg3(raw, frame),
            MessageKind::GroupMsg1 => self.on_group_msg1(raw, frame),
            _ => Err(self.unexpected(frame)),
        }
    }

    fn on_msg1(&mut self, frame: &KeyFrame, rng: &mut dyn SecureRng) -> Result<Vec<Action>> {
        // Message 1 carries no MIC: it is checked against the last
        // authenticated counter but never advances it
        self.replay.check_fresh(frame.replay_counter)?;

        if !self.suite.is_legacy_wpa() {
            let key_data = KeyData::parse(&frame.key_data)?;
            if let (Some(offered), Some(ours)) = (key_data.pmkid(), self.pmkid) {
                if offered != ours {
                    return Err(HandshakeError::MalformedFrame(format!(
                        "message 1/4 names PMKID {}, expected {}",
                        offered, ours
                    )));
                }
            }
        }

        let retransmission = self.state == HandshakeState::PtkInitNegotiating
            && self.tptk.is_some()
            && frame.nonce == self.anonce;
        let rekey = self.ptk.is_some();
        if !retransmission {
            if self.tptk.is_some() || rekey {
                rng.fill_bytes(&mut self.snonce);
            }
            let pmk = self.pmk.as_ref().ok_or(HandshakeError::InvalidState {
                operation: "derive PTK",
                state: "no PMK",
            })?;
            self.tptk = Some(derive_ptk(
                pmk,
                self.own,
                self.peer,
                &frame.nonce,
                &self.snonce,
                &self.suite,
            )?);
            self.anonce = frame.nonce;
        }

        let mut builder = KeyDataBuilder::new().element(&self.own_ie);
        if let Some(rsnxe) = &self.own_rsnxe {
            builder = builder.element(rsnxe);
        }
        let key_data = builder.finish();
        let msg2 = build_key_frame(
            &self.suite,
            MessageKind::PairwiseMsg2,
            &FrameParams {
                replay_counter: frame.replay_counter,
                nonce: self.snonce,
                key_data: &key_data,
                ..Default::default()
            },
            self.tptk.as_ref(),
        )?;
        self.state = HandshakeState::PtkInitNegotiating;
        debug!(
            "Sending message 2/4 to {} (replay {}{})",
            self.peer,
            frame.replay_counter,
            if retransmission { ", same SNonce" } else { "" }
        );

        let mut actions = Vec::with_capacity(3);
        if rekey && !retransmission {
            actions.push(Action::Started { rekey: true });
        }
        actions.extend(self.transmit(msg2));
        Ok(actions)
    }

    fn on_msg3(&mut self, raw: &[u8], frame: &KeyFrame) -> Result<Vec<Action>> {
        let tptk = match &self.tptk {
            Some(tptk) => tptk,
            None => return Err(self.unexpected(frame)),
        };
        if frame.nonce != self.anonce {
            return Err(HandshakeError::MalformedFrame(
                "ANonce in message 3/4 differs from message 1/4".to_string(),
            ));
        }
        self.replay.check_fresh(frame.replay_counter)?;
        verify_mic(&self.suite, tptk.kck(), raw)?;
        self.replay.accept(frame.replay_counter);

        let plain = decrypt_key_data(&self.suite, tptk, frame)?;
        let key_data = KeyData::parse(&plain)?;
        if !same_ie(key_data.rsne(), &self.peer_ie)
            || key_data.rsnxe() != self.peer_rsnxe.as_deref()
        {
            warn!("Element in message 3/4 from {} differs from the beacon", self.peer);
            return Err(HandshakeError::IeMismatch);
        }

        let (gtk, igtk) = if self.suite.is_legacy_wpa() {
            (None, None)
        } else {
            let kde = key_data.gtk().ok_or_else(|| {
                HandshakeError::MalformedFrame("message 3/4 without a GTK".to_string())
            })?;
            let igtk = match (self.suite.group_mgmt, key_data.igtk()) {
                (Some(_), Some(kde)) => self.igtk_from(kde)?,
                (Some(_), None) => {
                    return Err(HandshakeError::MalformedFrame(
                        "message 3/4 without an IGTK".to_string(),
                    ))
                }
                (None, _) => None,
            };
            (Some(self.gtk_from(kde)?), igtk)
        };

        let msg4 = build_key_frame(
            &self.suite,
            MessageKind::PairwiseMsg4,
            &FrameParams {
                replay_counter: frame.replay_counter,
                ..Default::default()
            },
            Some(tptk),
        )?;

        let mut actions = vec![Action::Send(msg4.clone()), Action::CancelTimer];
        if self.ptk.as_ref() == Some(tptk) {
            // Same handshake answered again with a new replay counter
            debug!("Message 3/4 for keys already installed, not reinstalling");
        } else {
            self.ptk = self.tptk.clone();
            self.gtk = gtk.clone();
            self.igtk = igtk.clone();
            if let Some(ptk) = &self.ptk {
                info!("Pairwise keys installed with {} ({})", self.peer, self.suite.akm);
                actions.push(Action::Complete(InstalledKeys {
                    ptk: ptk.clone(),
                    gtk,
                    igtk,
                }));
            }
        }
        self.state = HandshakeState::PtkInitDone;
        self.last_sent = None;
        self.answered = Some((raw.to_vec(), msg4));
        Ok(actions)
    }

    fn on_group_msg1(&mut self, raw: &[u8], frame: &KeyFrame) -> Result<Vec<Action>> {
        let ptk = match &self.ptk {
            Some(ptk) => ptk,
            None => return Err(self.unexpected(frame)),
        };
        self.replay.check_fresh(frame.replay_counter)?;
        verify_mic(&self.suite, ptk.kck(), raw)?;
        self.replay.accept(frame.replay_counter);

        let plain = decrypt_key_data(&self.suite, ptk, frame)?;
        let (gtk, igtk) = if self.suite.is_legacy_wpa() {
            let len = self.suite.group.tk_len();
            if frame.key_length as usize != len || plain.len() < len {
                return Err(HandshakeError::MalformedFrame(format!(
                    "group message 1/2 carries {} bytes for a {}-byte GTK",
                    frame.key_length, len
                )));
            }
            (Gtk::new(&plain[..len], frame.key_info.key_index, true), None)
        } else {
            let key_data = KeyData::parse(&plain)?;
            let kde = key_data.gtk().ok_or_else(|| {
                HandshakeError::MalformedFrame("group message 1/2 without a GTK".to_string())
            })?;
            let igtk = match key_data.igtk() {
                Some(kde) => self.igtk_from(kde)?,
                None => None,
            };
            (self.gtk_from(kde)?, igtk)
        };

        let msg2 = build_key_frame(
            &self.suite,
            MessageKind::GroupMsg2,
            &FrameParams {
                replay_counter: frame.replay_counter,
                key_index: gtk.index,
                ..Default::default()
            },
            Some(ptk),
        )?;

        let mut actions = vec![Action::Send(msg2.clone())];
        if self.gtk.as_ref() == Some(&gtk) {
            debug!("GTK index {} already installed, not reinstalling", gtk.index);
        } else {
            info!("Group key index {} installed from {}", gtk.index, self.peer);
            self.gtk = Some(gtk.clone());
            if igtk.is_some() {
                self.igtk = igtk.clone();
            }
            actions.push(Action::InstallGroup { gtk, igtk });
        }
        self.state = HandshakeState::RekeyEstablished;
        self.answered = Some((raw.to_vec(), msg2));
        Ok(actions)
    }

    fn gtk_from(&self, kde: &GtkKde) -> Result<Gtk> {
        if kde.gtk.len() != self.suite.group.tk_len() {
            return Err(HandshakeError::MalformedFrame(format!(
                "{}-byte GTK for {}",
                kde.gtk.len(),
                self.suite.group
            )));
        }
        Ok(Gtk::new(&kde.gtk, kde.key_id, kde.tx))
    }

    /// None when no management group cipher was negotiated
    fn igtk_from(&self, kde: &IgtkKde) -> Result<Option<Igtk>> {
        let Some(cipher) = self.suite.group_mgmt else {
            debug!("IGTK from {} ignored, management frames are unprotected", self.peer);
            return Ok(None);
        };
        if kde.igtk.len() != cipher.tk_len() {
            return Err(HandshakeError::MalformedFrame(format!(
                "{}-byte IGTK for {}",
                kde.igtk.len(),
                cipher
            )));
        }
        Ok(Some(Igtk::new(&kde.igtk, kde.key_id, kde.ipn)))
    }

    fn send_request(&mut self, pairwise: bool, error: bool) -> Result<Vec<Action>> {
        if self.role != Role::Supplicant {
            return Err(HandshakeError::InvalidState {
                operation: "EAPOL-Key request",
                state: "authenticator",
            });
        }
        let counter = self.replay.next_request_counter();
        let frame = build_key_frame(
            &self.suite,
            MessageKind::Request,
            &FrameParams {
                replay_counter: counter,
                pairwise_request: pairwise,
                error,
                secure: true,
                ..Default::default()
            },
            Some(self.installed_ptk("EAPOL-Key request")?),
        )?;
        Ok(vec![Action::Send(frame)])
    }

    /// Supplicant: ask the authenticator for a new GTK (or a new PTK)
    pub fn request_rekey(&mut self, pairwise: bool) -> Result<Vec<Action>> {
        debug!("Requesting {} rekey from {}", if pairwise { "pairwise" } else { "group" }, self.peer);
        self.send_request(pairwise, false)
    }

    /// Supplicant: report a Michael MIC failure on unicast traffic
    pub fn report_mic_failure(&mut self) -> Result<Vec<Action>> {
        let actions = self.send_request(true, true)?;
        self.mic_failures += 1;
        warn!("Reported Michael MIC failure to {}", self.peer);
        Ok(actions)
    }
}
