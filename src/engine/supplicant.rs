use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{Peer, RoleContext, Teardown};
use crate::eapol::rsne::{rsnxe_h2e, Rsne};
use crate::error::ReasonCode;
use crate::handshake::{HandshakeState, SessionConfig};
use crate::keys::Pmk;
use crate::sae::frame::{TRANSACTION_COMMIT, TRANSACTION_CONFIRM};
use crate::sae::{CommitOutcome, SaeExchange, SaeMessage};
use crate::types::{MacAddr, Pmkid, Role};

impl RoleContext {
    /// Join an AP: authenticate (SAE, cached PMKSA or PSK) and associate
    pub(super) async fn on_connect(&self, bssid: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>) {
        let (ap_rsne, suite) = match self.negotiate(&ie) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                warn!("Cannot join {}: {}", bssid, reason);
                self.observer.handshake_failed(Role::Supplicant, bssid, reason);
                return;
            }
        };
        info!("Joining {} ({}, {})", bssid, suite.akm, suite.pairwise);

        let assoc = if ap_rsne.is_wpa() {
            Rsne::build_wpa(&[suite.akm], &[suite.pairwise], suite.group)
        } else {
            Rsne::build(
                &[suite.akm],
                &[suite.pairwise],
                suite.group,
                self.advertised.capabilities,
                suite.group_mgmt,
            )
        };
        let ap_h2e = rsnxe.as_deref().map_or(false, rsnxe_h2e);
        let config = SessionConfig {
            role: Role::Supplicant,
            own: self.own(),
            peer: bssid,
            suite: suite.clone(),
            own_ie: assoc.encode(),
            own_rsnxe: self.rsnxe.clone(),
            peer_ie: ie,
            peer_rsnxe: rsnxe,
            retry: self.settings.retry,
        };

        let entry = self.peer_or_insert(bssid).await;
        let mut entry = entry.lock().await;
        entry.cancel_timers();
        entry.session = None;
        entry.sae = None;
        entry.config = Some(config);
        entry.assoc = Some(assoc);

        let cached = {
            let cache = self.pmksa.lock().await;
            cache
                .entry_for(bssid)
                .filter(|e| e.akm == suite.akm)
                .map(|e| (e.pmk.clone(), e.pmkid))
        };
        if let Some((pmk, pmkid)) = cached {
            info!("Offering cached PMKSA {} to {}", pmkid, bssid);
            self.associate(bssid, &mut entry, pmk, Some(pmkid)).await;
            return;
        }

        if suite.akm.is_sae() {
            let mut params = self.settings.sae.params.clone();
            params.pwe = self.settings.sae.h2e.method_for(ap_h2e);
            let mut sae = SaeExchange::new(
                self.own(),
                bssid,
                self.settings.passphrase.as_bytes(),
                &self.settings.ssid,
                params,
            );
            let commit = {
                let mut rng = self.rng.lock().await;
                sae.commit(rng.as_mut())
            };
            entry.sae = Some(sae);
            match commit {
                Ok(commit) => {
                    self.lower
                        .send_auth(self.own(), bssid, SaeMessage::Commit(commit).encode());
                    self.arm_sae(bssid, &mut entry);
                }
                Err(e) => self.sae_failed(bssid, &mut entry, TRANSACTION_COMMIT, e),
            }
        } else if let Some(pmk) = self.psk.clone() {
            self.associate(bssid, &mut entry, pmk, None).await;
        } else {
            // 802.1X: the PMK arrives later through `PmkReady`
            let ie = entry.assoc.as_ref().map(Rsne::encode).unwrap_or_default();
            self.lower.associate(self.own(), bssid, ie, self.rsnxe.clone());
        }
    }

    /// Start the session with `pmk`, then send the association request
    async fn associate(&self, bssid: MacAddr, entry: &mut Peer, pmk: Pmk, pmkid: Option<Pmkid>) {
        let Some(config) = entry.config.clone() else {
            warn!("No association parameters for {}", bssid);
            return;
        };
        self.start_session(bssid, entry, config, pmk, pmkid).await;
        if entry.session.as_ref().map(|s| s.state()) != Some(HandshakeState::PtkStart) {
            return;
        }
        let Some(assoc) = entry.assoc.clone() else {
            return;
        };
        let assoc = match pmkid {
            Some(pmkid) if !assoc.is_wpa() => assoc.with_pmkid(pmkid),
            _ => assoc,
        };
        debug!("Associating with {}", bssid);
        self.lower
            .associate(self.own(), bssid, assoc.encode(), self.rsnxe.clone());
    }

    pub(super) async fn on_sae_frame_sta(&self, bssid: MacAddr, frame: Bytes) {
        let msg = match SaeMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Bad SAE frame from {}: {}", bssid, e);
                return;
            }
        };
        debug!("{} <- {}: {}", self.own(), bssid, msg);
        let Some(entry) = self.peer(bssid).await else {
            debug!("SAE frame from {} without an exchange", bssid);
            return;
        };
        let mut entry = entry.lock().await;
        if !entry.sae_pending() {
            debug!("SAE frame from {} outside an exchange", bssid);
            return;
        }
        let own = self.own();

        match msg {
            SaeMessage::Commit(commit) => {
                let result = match entry.sae.as_mut() {
                    Some(sae) => {
                        let mut rng = self.rng.lock().await;
                        sae.process_peer_commit(&commit, rng.as_mut())
                    }
                    None => return,
                };
                match result {
                    Ok(CommitOutcome::Accept { commit, confirm }) => {
                        if let Some(commit) = commit {
                            self.lower.send_auth(own, bssid, SaeMessage::Commit(commit).encode());
                        }
                        self.lower.send_auth(own, bssid, SaeMessage::Confirm(confirm).encode());
                        self.arm_sae(bssid, &mut entry);
                    }
                    Ok(CommitOutcome::Reject(status)) => {
                        let reply = SaeMessage::Rejected {
                            transaction: TRANSACTION_COMMIT,
                            status: status as u16,
                        };
                        self.lower.send_auth(own, bssid, reply.encode());
                        entry.cancel_timers();
                        self.post_teardown(bssid, Teardown::Failure(ReasonCode::Unspecified));
                    }
                    Ok(CommitOutcome::RequestToken(_)) => {}
                    Err(e) => self.sae_failed(bssid, &mut entry, TRANSACTION_COMMIT, e),
                }
            }
            SaeMessage::Confirm(confirm) => {
                let result = match entry.sae.as_mut() {
                    Some(sae) => sae.confirm(&confirm),
                    None => return,
                };
                match result {
                    Ok(keys) => {
                        self.sae_accepted(bssid, &mut entry, keys.pmk.clone(), keys.pmkid)
                            .await;
                        entry.pmk = None;
                        self.associate(bssid, &mut entry, keys.pmk, Some(keys.pmkid))
                            .await;
                    }
                    Err(e) => {
                        self.sae_failed(bssid, &mut entry, TRANSACTION_CONFIRM, e)
                    }
                }
            }
            SaeMessage::TokenRequest { token, .. } => {
                let result = match entry.sae.as_mut() {
                    Some(sae) => sae.retry_with_token(token),
                    None => return,
                };
                match result {
                    Ok(commit) => {
                        debug!("Retrying SAE commit to {} with a token", bssid);
                        self.lower.send_auth(own, bssid, SaeMessage::Commit(commit).encode());
                        self.arm_sae(bssid, &mut entry);
                    }
                    Err(e) => self.sae_failed(bssid, &mut entry, TRANSACTION_COMMIT, e),
                }
            }
            SaeMessage::Rejected { transaction, status } => {
                warn!(
                    "{} rejected SAE transaction {} with status {}",
                    bssid, transaction, status
                );
                entry.cancel_timers();
                self.post_teardown(bssid, Teardown::Failure(ReasonCode::Unspecified));
            }
        }
    }
}
