use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Peer, RoleContext, Teardown};
use crate::error::ReasonCode;
use crate::handshake::SessionConfig;
use crate::sae::frame::{TRANSACTION_COMMIT, TRANSACTION_CONFIRM};
use crate::sae::{CommitOutcome, SaeCommit, SaeConfirm, SaeMessage, SaeResponder, SaeState};
use crate::types::{MacAddr, Role};

impl RoleContext {
    /// A station associated: pick its PMK and start the 4-way handshake
    pub(super) async fn on_associated(&self, peer: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>) {
        let (sta_rsne, suite) = match self.negotiate(&ie) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                warn!("Refusing association of {}: {}", peer, reason);
                self.lower.deauthenticate(self.own(), peer, reason);
                self.observer.handshake_failed(Role::Authenticator, peer, reason);
                self.teardown(peer, Teardown::Quiet).await;
                return;
            }
        };
        info!("{} associated ({}, {})", peer, suite.akm, suite.pairwise);

        let entry = self.peer_or_insert(peer).await;
        let mut entry = entry.lock().await;
        entry.resend.cancel();
        entry.session = None;

        let cached = {
            let cache = self.pmksa.lock().await;
            sta_rsne
                .pmkids
                .iter()
                .find_map(|id| cache.lookup(peer, id).map(|pmk| (pmk.clone(), Some(*id))))
        };
        let credential = if let Some(found) = cached {
            debug!("PMKSA cache hit for {}", peer);
            Some(found)
        } else if suite.akm.is_sae() {
            entry.pmk.take()
        } else if suite.akm.is_psk() {
            self.psk.clone().map(|pmk| (pmk, None))
        } else {
            None
        };

        let config = SessionConfig {
            role: Role::Authenticator,
            own: self.own(),
            peer,
            suite: suite.clone(),
            own_ie: self.ie.clone(),
            own_rsnxe: self.rsnxe.clone(),
            peer_ie: ie,
            peer_rsnxe: rsnxe,
            retry: self.settings.retry,
        };
        match credential {
            Some((pmk, pmkid)) => self.start_session(peer, &mut entry, config, pmk, pmkid).await,
            None if suite.akm.is_sae() => {
                warn!("{} associated without completing SAE", peer);
                entry.cancel_timers();
                self.post_teardown(peer, Teardown::Failure(ReasonCode::PrevAuthNotValid));
            }
            None => {
                info!("Waiting for 802.1X PMK for {}", peer);
                entry.config = Some(config);
            }
        }
    }

    pub(super) async fn on_sae_frame_ap(&self, peer: MacAddr, frame: Bytes) {
        let msg = match SaeMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Bad SAE frame from {}: {}", peer, e);
                return;
            }
        };
        debug!("{} <- {}: {}", self.own(), peer, msg);
        let Some(responder) = &self.responder else {
            debug!("SAE frame from {} but SAE is not enabled", peer);
            return;
        };
        match msg {
            SaeMessage::Commit(commit) => self.on_sae_commit(responder, peer, commit).await,
            SaeMessage::Confirm(confirm) => self.on_sae_confirm(peer, confirm).await,
            SaeMessage::Rejected { status, .. } => {
                if let Some(entry) = self.peer(peer).await {
                    let mut entry = entry.lock().await;
                    if entry.sae_pending() {
                        info!("{} abandoned SAE (status {})", peer, status);
                        entry.cancel_timers();
                        self.post_teardown(peer, Teardown::Quiet);
                    }
                }
            }
            other => debug!("Unexpected {} from {}", other, peer),
        }
    }

    async fn on_sae_commit(&self, responder: &SaeResponder, peer: MacAddr, commit: SaeCommit) {
        // A commit for an exchange in progress is a retransmission or the
        // peer's answer to ours
        if let Some(entry) = self.peer(peer).await {
            let mut entry = entry.lock().await;
            if let Some(sae) = entry.sae.as_mut() {
                if sae.state() != SaeState::Accepted {
                    let result = {
                        let mut rng = self.rng.lock().await;
                        sae.process_peer_commit(&commit, rng.as_mut())
                    };
                    match result {
                        Ok(outcome) => {
                            self.send_commit_outcome(peer, Some(&mut *entry), commit.group, outcome)
                        }
                        Err(e) => self.sae_failed(peer, &mut entry, TRANSACTION_COMMIT, e),
                    }
                    return;
                }
            }
        }

        let pending = self.sae_pending_count(peer).await;
        let result = {
            let mut rng = self.rng.lock().await;
            responder.on_commit(peer, pending, &commit, rng.as_mut())
        };
        match result {
            Ok((Some(exchange), outcome)) => {
                let entry = self.peer_or_insert(peer).await;
                let mut entry = entry.lock().await;
                entry.sae = Some(exchange);
                entry.pmk = None;
                self.send_commit_outcome(peer, Some(&mut *entry), commit.group, outcome);
            }
            Ok((None, outcome)) => self.send_commit_outcome(peer, None, commit.group, outcome),
            Err(e) => debug!("SAE commit from {} dropped: {}", peer, e),
        }
    }

    /// Answer a commit. `entry` is `None` when no state was allocated.
    fn send_commit_outcome(
        &self,
        peer: MacAddr,
        entry: Option<&mut Peer>,
        group: u16,
        outcome: CommitOutcome,
    ) {
        let own = self.own();
        match outcome {
            CommitOutcome::Accept { commit, confirm } => {
                if let Some(commit) = commit {
                    self.lower.send_auth(own, peer, SaeMessage::Commit(commit).encode());
                }
                self.lower.send_auth(own, peer, SaeMessage::Confirm(confirm).encode());
                if let Some(entry) = entry {
                    self.arm_sae(peer, entry);
                }
            }
            CommitOutcome::Reject(status) => {
                info!("Rejecting SAE commit from {}: status {:?}", peer, status);
                let reply = SaeMessage::Rejected {
                    transaction: TRANSACTION_COMMIT,
                    status: status as u16,
                };
                self.lower.send_auth(own, peer, reply.encode());
            }
            CommitOutcome::RequestToken(token) => {
                self.lower
                    .send_auth(own, peer, SaeMessage::TokenRequest { group, token }.encode());
            }
        }
    }

    async fn on_sae_confirm(&self, peer: MacAddr, confirm: SaeConfirm) {
        let Some(entry) = self.peer(peer).await else {
            debug!("SAE confirm from {} without an exchange", peer);
            return;
        };
        let mut entry = entry.lock().await;
        let Some(sae) = entry.sae.as_mut() else {
            debug!("SAE confirm from {} without an exchange", peer);
            return;
        };
        match sae.confirm(&confirm) {
            Ok(keys) => self.sae_accepted(peer, &mut entry, keys.pmk, keys.pmkid).await,
            Err(e) => self.sae_failed(peer, &mut entry, TRANSACTION_CONFIRM, e),
        }
    }

    /// Peers other than `except` still holding an unfinished exchange
    async fn sae_pending_count(&self, except: MacAddr) -> usize {
        let entries: Vec<Arc<Mutex<Peer>>> = self
            .peers
            .lock()
            .await
            .iter()
            .filter(|(mac, _)| **mac != except)
            .map(|(_, entry)| entry.clone())
            .collect();
        let mut pending = 0;
        for entry in entries {
            if entry.lock().await.sae_pending() {
                pending += 1;
            }
        }
        pending
    }

    /// Rotate the group keys and run the group handshake with every member
    pub(super) async fn on_group_rekey(&self) {
        let Some(group) = &self.group else {
            warn!("Group rekey requested on a station");
            return;
        };
        let entries: Vec<(MacAddr, Arc<Mutex<Peer>>)> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(mac, entry)| (*mac, entry.clone()))
            .collect();
        let mut members = Vec::with_capacity(entries.len());
        for (mac, entry) in entries {
            if entry.lock().await.group_member() {
                members.push((mac, entry));
            }
        }

        {
            let mut group = group.lock().await;
            if let Err(e) = group.begin_rekey(members.iter().map(|(mac, _)| *mac)) {
                error!("Group rekey failed: {}", e);
                return;
            }
            if members.is_empty() {
                self.observer.group_rekey_complete(group.gtk().index);
                return;
            }
        }

        for (mac, entry) in members {
            let mut entry = entry.lock().await;
            let result = {
                let group = group.lock().await;
                match entry.session.as_mut() {
                    Some(session) => session.start_group_rekey(&group),
                    None => continue,
                }
            };
            self.apply(mac, &mut entry, result).await;
        }
    }
}
