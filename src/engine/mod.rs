//! Protocol engine for one radio role
//!
//! A role context owns the session table of its role: the authenticator
//! keeps one record per associated station, the supplicant one per access
//! point, and the two never share a table. The table lock only guards
//! insertion and removal; each record has its own lock for in-place updates.
//!
//! Every state change happens on the protocol task, which consumes `Event`s
//! posted by the lower MAC, by timers and by `EngineHandle`. A timer only
//! posts an event: the task checks that the record still exists and that
//! the timer was not re-armed before acting on it.

mod authenticator;
mod supplicant;
pub mod timer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::eapol::rsne::{encode_rsnxe, RsnCapabilities, Rsne};
use crate::error::{Disposition, HandshakeError, ReasonCode};
use crate::governor::RetryPolicy;
use crate::group::GroupKeyContext;
use crate::handshake::{Action, HandshakeState, InstalledKeys, Session, SessionConfig};
use crate::keys::{Gtk, Pmk};
use crate::pmksa::{PmksaCache, PmksaStore};
use crate::sae::{H2eMode, SaeExchange, SaeMessage, SaeParams, SaeResponder, SaeState};
use crate::suite::{Akm, Cipher, CipherSuite, Pmf, SecurityPolicy};
use crate::types::{MacAddr, Pmkid, Role, SecureRng};
use timer::{TimerKind, TimerQueue, TimerSlot};

/// Frame transmission and association control provided by the lower MAC
///
/// Every call is fire-and-forget; the engine never waits on the radio.
pub trait LowerMac: Send + Sync {
    /// Transmit an EAPOL frame (ethertype 0x888E)
    fn send_eapol(&self, own: MacAddr, peer: MacAddr, frame: Bytes);
    /// Transmit an SAE authentication frame body
    fn send_auth(&self, own: MacAddr, peer: MacAddr, frame: Bytes);
    /// Station: send an association request carrying our RSN/WPA element
    fn associate(&self, own: MacAddr, bssid: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>);
    fn deauthenticate(&self, own: MacAddr, peer: MacAddr, reason: ReasonCode);
}

/// Session lifecycle notifications for the data path
pub trait SessionObserver: Send + Sync {
    fn handshake_started(&self, _role: Role, _peer: MacAddr, _rekey: bool) {}
    fn handshake_complete(&self, _role: Role, _peer: MacAddr, _keys: &InstalledKeys) {}
    fn handshake_failed(&self, _role: Role, _peer: MacAddr, _reason: ReasonCode) {}
    /// Supplicant: new group keys installed. Authenticator: `peer`
    /// acknowledged the current group keys.
    fn group_keys_installed(&self, _role: Role, _peer: MacAddr, _gtk: &Gtk) {}
    /// Authenticator: every member now holds the GTK with this index
    fn group_rekey_complete(&self, _gtk_index: u8) {}
}

#[derive(Debug)]
pub enum Event {
    /// Authenticator: a station associated carrying these elements
    Associated {
        peer: MacAddr,
        ie: Vec<u8>,
        rsnxe: Option<Vec<u8>>,
    },
    /// Supplicant: join the AP whose beacon carries these elements
    Connect {
        bssid: MacAddr,
        ie: Vec<u8>,
        rsnxe: Option<Vec<u8>>,
    },
    Disassociated {
        peer: MacAddr,
    },
    Eapol {
        peer: MacAddr,
        frame: Bytes,
    },
    Auth {
        peer: MacAddr,
        frame: Bytes,
    },
    /// PMK produced by an external 802.1X exchange
    PmkReady {
        peer: MacAddr,
        pmk: Pmk,
    },
    Timeout {
        peer: MacAddr,
        kind: TimerKind,
        generation: u64,
    },
    GroupRekey,
    PairwiseRekey {
        peer: MacAddr,
    },
    RequestRekey {
        peer: MacAddr,
        pairwise: bool,
    },
    MicFailure {
        peer: MacAddr,
    },
    FlushPmksa {
        peer: Option<MacAddr>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SaeSettings {
    pub params: SaeParams,
    pub h2e: H2eMode,
    /// Peers with SAE state pending before commits need a token
    pub anti_clogging_threshold: usize,
    pub retrans_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for SaeSettings {
    fn default() -> Self {
        Self {
            params: SaeParams::default(),
            h2e: H2eMode::Disabled,
            anti_clogging_threshold: 5,
            retrans_timeout: Duration::from_millis(1000),
            auth_timeout: Duration::from_millis(5000),
        }
    }
}

/// Everything a role needs that does not change while it runs
#[derive(Clone)]
pub struct RoleSettings {
    pub role: Role,
    pub own: MacAddr,
    pub policy: SecurityPolicy,
    pub ssid: Vec<u8>,
    pub passphrase: String,
    /// Preference order
    pub pairwise: Vec<Cipher>,
    pub group: Cipher,
    pub pmf: Pmf,
    pub legacy_wpa: bool,
    pub retry: RetryPolicy,
    pub sae: SaeSettings,
    pub pmksa_lifetime: chrono::Duration,
    pub pmksa_capacity: usize,
    /// Authenticator: periodic group rekey
    pub group_rekey_interval: Option<Duration>,
    /// Authenticator: new group keys whenever a member leaves
    pub rekey_on_leave: bool,
}

impl fmt::Debug for RoleSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSettings")
            .field("role", &self.role)
            .field("own", &self.own)
            .field("policy", &self.policy)
            .field("ssid", &String::from_utf8_lossy(&self.ssid))
            .field("pairwise", &self.pairwise)
            .field("group", &self.group)
            .field("pmf", &self.pmf)
            .field("legacy_wpa", &self.legacy_wpa)
            .field("retry", &self.retry)
            .field("sae", &self.sae)
            .finish_non_exhaustive()
    }
}

impl RoleSettings {
    pub fn new(
        role: Role,
        own: MacAddr,
        policy: SecurityPolicy,
        ssid: &[u8],
        passphrase: &str,
    ) -> Self {
        let (pairwise, group) = if policy.is_legacy_wpa() {
            (vec![Cipher::Tkip], Cipher::Tkip)
        } else {
            (vec![Cipher::Ccmp128], Cipher::Ccmp128)
        };
        Self {
            role,
            own,
            policy,
            ssid: ssid.to_vec(),
            passphrase: passphrase.to_string(),
            pairwise,
            group,
            pmf: Pmf::Optional,
            legacy_wpa: policy.is_legacy_wpa(),
            retry: match role {
                Role::Authenticator => RetryPolicy::authenticator(),
                Role::Supplicant => RetryPolicy::supplicant(),
            },
            sae: SaeSettings::default(),
            pmksa_lifetime: chrono::Duration::seconds(PmksaCache::DEFAULT_LIFETIME_SECS),
            pmksa_capacity: PmksaCache::DEFAULT_CAPACITY,
            group_rekey_interval: None,
            rekey_on_leave: false,
        }
    }

    /// RSN (or WPA) element listing everything this role accepts: the
    /// beacon element of an AP, the capability set of a station
    pub fn advertised_rsne(&self) -> Rsne {
        let akms = self.policy.akms();
        if self.policy.is_legacy_wpa() {
            return Rsne::build_wpa(akms, &self.pairwise, self.group);
        }
        let pmf = self.policy.pmf(self.pmf);
        let caps = RsnCapabilities::default()
            .with_mfpc(pmf != Pmf::Disabled)
            .with_mfpr(pmf == Pmf::Required);
        let group_mgmt = (pmf != Pmf::Disabled).then_some(Cipher::BipCmac128);
        Rsne::build(akms, &self.pairwise, self.group, Some(caps), group_mgmt)
    }

    /// RSNXE advertising SAE hash-to-element, when enabled
    pub fn rsnxe(&self) -> Option<Vec<u8>> {
        (self.policy.uses_sae() && self.sae.h2e != H2eMode::Disabled).then(|| encode_rsnxe(true))
    }
}

/// Per-peer record: the handshake session and whatever precedes it
#[derive(Default)]
struct Peer {
    session: Option<Session>,
    config: Option<SessionConfig>,
    /// Station: element for the association request (PMKID added later)
    assoc: Option<Rsne>,
    sae: Option<SaeExchange>,
    /// Credential accepted ahead of the 4-way handshake
    pmk: Option<(Pmk, Option<Pmkid>)>,
    resend: TimerSlot,
    sae_retransmit: TimerSlot,
    sae_deadline: TimerSlot,
}

impl Peer {
    fn installed(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.ptk().is_some())
    }

    /// Holds pairwise keys and is not in the middle of a 4-way handshake
    fn group_member(&self) -> bool {
        self.session.as_ref().map_or(false, |s| {
            matches!(
                s.state(),
                HandshakeState::PtkInitDone
                    | HandshakeState::RekeyNegotiating
                    | HandshakeState::RekeyEstablished
            )
        })
    }

    fn sae_pending(&self) -> bool {
        self.sae.as_ref().map_or(false, |s| s.state() != SaeState::Accepted)
    }

    fn slot(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Resend => &mut self.resend,
            TimerKind::SaeRetransmit => &mut self.sae_retransmit,
            TimerKind::SaeAuth => &mut self.sae_deadline,
        }
    }

    fn cancel_timers(&mut self) {
        self.resend.cancel();
        self.sae_retransmit.cancel();
        self.sae_deadline.cancel();
    }
}

/// How a record leaves the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The peer left; nothing to send
    Quiet,
    /// We are leaving: deauthenticate without reporting a failure
    Leave(ReasonCode),
    /// Deauthenticate and report `handshake_failed`
    Failure(ReasonCode),
}

struct RoleContext {
    settings: RoleSettings,
    /// Beacon element (authenticator) or capability element (supplicant)
    advertised: Rsne,
    ie: Vec<u8>,
    rsnxe: Option<Vec<u8>>,
    /// PMK derived from the passphrase for PSK AKMs
    psk: Option<Pmk>,
    peers: Mutex<HashMap<MacAddr, Arc<Mutex<Peer>>>>,
    group: Option<Mutex<GroupKeyContext>>,
    pmksa: Mutex<PmksaCache>,
    store: Option<Box<dyn PmksaStore>>,
    responder: Option<SaeResponder>,
    rng: Mutex<Box<dyn SecureRng>>,
    lower: Arc<dyn LowerMac>,
    observer: Arc<dyn SessionObserver>,
    events: mpsc::UnboundedSender<Event>,
    timers: TimerQueue,
}

/// A role context that has not started its protocol task yet
pub struct Engine {
    ctx: Arc<RoleContext>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Engine {
    pub fn new(
        settings: RoleSettings,
        lower: Arc<dyn LowerMac>,
        observer: Arc<dyn SessionObserver>,
        mut rng: Box<dyn SecureRng>,
        store: Option<Box<dyn PmksaStore>>,
    ) -> anyhow::Result<Self> {
        if settings.policy.is_legacy_wpa() && !settings.legacy_wpa {
            anyhow::bail!("Policy {:?} needs legacy_wpa = true", settings.policy);
        }
        let advertised = settings.advertised_rsne();
        let ie = advertised.encode();
        let rsnxe = settings.rsnxe();

        let psk = if settings.policy.akms().iter().any(|a| a.is_psk()) {
            Some(
                Pmk::from_passphrase(&settings.passphrase, &settings.ssid)
                    .context("Failed to derive PMK from passphrase")?,
            )
        } else {
            None
        };

        let group = match settings.role {
            Role::Authenticator => {
                let pmf = settings.policy.pmf(settings.pmf);
                let akm = *settings.policy.akms().first().context("Policy has no AKM")?;
                let bss_suite = CipherSuite::new(
                    akm,
                    settings.pairwise.first().copied().unwrap_or(settings.group),
                    settings.group,
                    (pmf != Pmf::Disabled).then_some(Cipher::BipCmac128),
                    if advertised.is_wpa() {
                        crate::eapol::key_info::DescriptorType::Wpa
                    } else {
                        crate::eapol::key_info::DescriptorType::Rsn
                    },
                    settings.legacy_wpa,
                )
                .context("Invalid BSS cipher configuration")?;
                let ctx = GroupKeyContext::new(
                    settings.own,
                    bss_suite,
                    ie.clone(),
                    rsnxe.clone(),
                    rng.as_mut(),
                )
                .context("Failed to bring up group keys")?;
                Some(Mutex::new(ctx))
            }
            Role::Supplicant => None,
        };

        let responder = (settings.role == Role::Authenticator && settings.policy.uses_sae()).then(|| {
            SaeResponder::new(
                settings.own,
                settings.passphrase.as_bytes(),
                &settings.ssid,
                settings.sae.params.clone(),
                settings.sae.anti_clogging_threshold,
                rng.as_mut(),
            )
            .with_h2e(settings.sae.h2e)
        });

        let mut pmksa = PmksaCache::new(settings.pmksa_lifetime, settings.pmksa_capacity);
        if let Some(store) = &store {
            let entries = store.load().context("Failed to load PMKSA store")?;
            info!("Restored {} PMKSA entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            pmksa.restore(entries);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            "{} {} ready: policy {:?}, SSID {:?}",
            settings.role,
            settings.own,
            settings.policy,
            String::from_utf8_lossy(&settings.ssid)
        );
        Ok(Self {
            ctx: Arc::new(RoleContext {
                settings,
                advertised,
                ie,
                rsnxe,
                psk,
                peers: Mutex::new(HashMap::new()),
                group,
                pmksa: Mutex::new(pmksa),
                store,
                responder,
                rng: Mutex::new(rng),
                lower,
                observer,
                timers: TimerQueue::new(tx.clone()),
                events: tx,
            }),
            events: rx,
        })
    }

    /// Start the protocol task (and the periodic group rekey, if any)
    pub fn spawn(self) -> EngineHandle {
        let ctx = self.ctx;
        let mut events = self.events;

        let ticker = match (ctx.settings.role, ctx.settings.group_rekey_interval) {
            (Role::Authenticator, Some(interval)) if !interval.is_zero() => {
                let tx = ctx.events.clone();
                Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if tx.send(Event::GroupRekey).is_err() {
                            break;
                        }
                    }
                }))
            }
            _ => None,
        };

        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Event::Shutdown = event {
                    break;
                }
                task_ctx.handle(event).await;
            }
            if let Some(ticker) = ticker {
                ticker.abort();
            }
            task_ctx.shutdown().await;
        });

        EngineHandle {
            ctx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Cloneable front end of a running engine
///
/// Posting methods never block: they queue an event for the protocol task
/// and fail only once the engine has stopped.
#[derive(Clone)]
pub struct EngineHandle {
    ctx: Arc<RoleContext>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn role(&self) -> Role {
        self.ctx.settings.role
    }

    pub fn own(&self) -> MacAddr {
        self.ctx.settings.own
    }

    /// The element this role advertises in beacons / probe responses
    pub fn advertised_ie(&self) -> &[u8] {
        &self.ctx.ie
    }

    pub fn advertised_rsnxe(&self) -> Option<&[u8]> {
        self.ctx.rsnxe.as_deref()
    }

    pub fn post(&self, event: Event) -> anyhow::Result<()> {
        self.ctx
            .events
            .send(event)
            .map_err(|_| anyhow::anyhow!("Engine for {} has stopped", self.ctx.settings.own))
    }

    pub fn associated(&self, peer: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>) -> anyhow::Result<()> {
        self.post(Event::Associated { peer, ie, rsnxe })
    }

    pub fn connect(&self, bssid: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>) -> anyhow::Result<()> {
        self.post(Event::Connect { bssid, ie, rsnxe })
    }

    pub fn disassociated(&self, peer: MacAddr) -> anyhow::Result<()> {
        self.post(Event::Disassociated { peer })
    }

    pub fn deliver_eapol(&self, peer: MacAddr, frame: Bytes) -> anyhow::Result<()> {
        self.post(Event::Eapol { peer, frame })
    }

    pub fn deliver_auth(&self, peer: MacAddr, frame: Bytes) -> anyhow::Result<()> {
        self.post(Event::Auth { peer, frame })
    }

    pub fn pmk_ready(&self, peer: MacAddr, pmk: Pmk) -> anyhow::Result<()> {
        self.post(Event::PmkReady { peer, pmk })
    }

    pub fn group_rekey(&self) -> anyhow::Result<()> {
        self.post(Event::GroupRekey)
    }

    pub fn pairwise_rekey(&self, peer: MacAddr) -> anyhow::Result<()> {
        self.post(Event::PairwiseRekey { peer })
    }

    pub fn request_rekey(&self, peer: MacAddr, pairwise: bool) -> anyhow::Result<()> {
        self.post(Event::RequestRekey { peer, pairwise })
    }

    pub fn report_mic_failure(&self, peer: MacAddr) -> anyhow::Result<()> {
        self.post(Event::MicFailure { peer })
    }

    pub fn flush_pmksa(&self, peer: Option<MacAddr>) -> anyhow::Result<()> {
        self.post(Event::FlushPmksa { peer })
    }

    pub async fn state(&self, peer: MacAddr) -> Option<HandshakeState> {
        let entry = self.ctx.peer(peer).await?;
        let entry = entry.lock().await;
        entry.session.as_ref().map(|s| s.state())
    }

    pub async fn sae_state(&self, peer: MacAddr) -> Option<SaeState> {
        let entry = self.ctx.peer(peer).await?;
        let entry = entry.lock().await;
        entry.sae.as_ref().map(|s| s.state())
    }

    pub async fn uses_pmksa(&self, peer: MacAddr) -> bool {
        match self.ctx.peer(peer).await {
            Some(entry) => entry.lock().await.session.as_ref().map_or(false, |s| s.uses_pmksa()),
            None => false,
        }
    }

    pub async fn peers(&self) -> Vec<MacAddr> {
        let mut peers: Vec<MacAddr> = self.ctx.peers.lock().await.keys().copied().collect();
        peers.sort();
        peers
    }

    pub async fn pmksa_len(&self) -> usize {
        self.ctx.pmksa.lock().await.len()
    }

    /// Authenticator: the GTK currently handed out
    pub async fn current_gtk(&self) -> Option<Gtk> {
        match &self.ctx.group {
            Some(group) => Some(group.lock().await.gtk().clone()),
            None => None,
        }
    }

    /// Stop the protocol task, deauthenticating every peer
    pub async fn shutdown(&self) {
        // Already stopped when the send fails
        let _ = self.post(Event::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Engine task for {} ended abnormally: {}", self.ctx.settings.own, e);
            }
        }
    }
}

impl RoleContext {
    fn role(&self) -> Role {
        self.settings.role
    }

    fn own(&self) -> MacAddr {
        self.settings.own
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Engine for {} stopped, event dropped", self.own());
        }
    }

    /// Look a record up without keeping the table locked
    async fn peer(&self, mac: MacAddr) -> Option<Arc<Mutex<Peer>>> {
        self.peers.lock().await.get(&mac).cloned()
    }

    async fn peer_or_insert(&self, mac: MacAddr) -> Arc<Mutex<Peer>> {
        self.peers
            .lock()
            .await
            .entry(mac)
            .or_insert_with(|| Arc::new(Mutex::new(Peer::default())))
            .clone()
    }

    async fn handle(&self, event: Event) {
        match event {
            Event::Associated { peer, ie, rsnxe } => match self.role() {
                Role::Authenticator => self.on_associated(peer, ie, rsnxe).await,
                Role::Supplicant => warn!("Association event for {} on a station", peer),
            },
            Event::Connect { bssid, ie, rsnxe } => match self.role() {
                Role::Supplicant => self.on_connect(bssid, ie, rsnxe).await,
                Role::Authenticator => warn!("Connect request for {} on an access point", bssid),
            },
            Event::Disassociated { peer } => {
                debug!("Session with {} ending", peer);
                self.teardown(peer, Teardown::Quiet).await;
            }
            Event::Eapol { peer, frame } => self.on_eapol(peer, frame).await,
            Event::Auth { peer, frame } => match self.role() {
                Role::Authenticator => self.on_sae_frame_ap(peer, frame).await,
                Role::Supplicant => self.on_sae_frame_sta(peer, frame).await,
            },
            Event::PmkReady { peer, pmk } => self.on_pmk_ready(peer, pmk).await,
            Event::Timeout {
                peer,
                kind,
                generation,
            } => self.on_timer(peer, kind, generation).await,
            Event::GroupRekey => self.on_group_rekey().await,
            Event::PairwiseRekey { peer } => self.on_pairwise_rekey(peer).await,
            Event::RequestRekey { peer, pairwise } => {
                self.with_session(peer, "rekey request", |s, _| s.request_rekey(pairwise))
                    .await
            }
            Event::MicFailure { peer } => {
                self.with_session(peer, "MIC failure report", |s, _| s.report_mic_failure())
                    .await
            }
            Event::FlushPmksa { peer } => {
                self.pmksa.lock().await.flush(peer);
                self.persist_pmksa().await;
            }
            Event::Shutdown => {}
        }
    }

    async fn on_eapol(&self, peer: MacAddr, frame: Bytes) {
        let Some(entry) = self.peer(peer).await else {
            debug!("EAPOL frame from unknown peer {}, dropped", peer);
            return;
        };
        let mut entry = entry.lock().await;
        let Some(session) = entry.session.as_mut() else {
            debug!("EAPOL frame from {} before association, dropped", peer);
            return;
        };

        let result = {
            let group = match &self.group {
                Some(group) => Some(group.lock().await),
                None => None,
            };
            let mut rng = self.rng.lock().await;
            session.on_message_received(&frame, rng.as_mut(), group.as_deref())
        };
        self.apply(peer, &mut entry, result).await;
    }

    /// Run a session operation that takes the RNG, then carry out its
    /// actions
    async fn with_session<F>(&self, peer: MacAddr, what: &str, op: F)
    where
        F: FnOnce(&mut Session, &mut dyn SecureRng) -> crate::error::Result<Vec<Action>>,
    {
        let Some(entry) = self.peer(peer).await else {
            warn!("No session with {} for {}", peer, what);
            return;
        };
        let mut entry = entry.lock().await;
        let Some(session) = entry.session.as_mut() else {
            warn!("No session with {} for {}", peer, what);
            return;
        };
        let result = {
            let mut rng = self.rng.lock().await;
            op(session, rng.as_mut())
        };
        self.apply(peer, &mut entry, result).await;
    }

    async fn on_pairwise_rekey(&self, peer: MacAddr) {
        self.with_session(peer, "pairwise rekey", |s, rng| s.rekey_ptk(rng))
            .await
    }

    /// Handle the outcome of a session call made with `entry` locked
    async fn apply(
        &self,
        peer: MacAddr,
        entry: &mut Peer,
        result: crate::error::Result<Vec<Action>>,
    ) {
        match result {
            Ok(actions) => self.run_actions(peer, entry, actions).await,
            Err(e) => {
                let reason = entry.session.as_ref().and_then(|s| s.teardown_reason(&e));
                match (e.disposition(), reason) {
                    (Disposition::Drop, _) | (_, None) => {
                        debug!("Dropped frame from {}: {}", peer, e);
                    }
                    (_, Some(reason)) => {
                        warn!("Handshake with {} failed: {} (reason {})", peer, e, reason);
                        entry.cancel_timers();
                        self.post_teardown(peer, Teardown::Failure(reason));
                    }
                }
            }
        }
    }

    fn post_teardown(&self, peer: MacAddr, how: Teardown) {
        // Removal needs the table lock, which is never taken while a
        // record is held
        match how {
            Teardown::Failure(reason) => {
                self.lower.deauthenticate(self.own(), peer, reason);
                self.observer.handshake_failed(self.role(), peer, reason);
            }
            Teardown::Leave(reason) => self.lower.deauthenticate(self.own(), peer, reason),
            Teardown::Quiet => {}
        }
        self.post(Event::Disassociated { peer });
    }

    async fn run_actions(&self, peer: MacAddr, entry: &mut Peer, actions: Vec<Action>) {
        let role = self.role();
        for action in actions {
            match action {
                Action::Send(frame) => self.lower.send_eapol(self.own(), peer, frame),
                Action::ArmTimer(after) => {
                    entry.resend.arm(after, peer, TimerKind::Resend, &self.timers)
                }
                Action::CancelTimer => entry.resend.cancel(),
                Action::Started { rekey } => self.observer.handshake_started(role, peer, rekey),
                Action::Complete(keys) => {
                    info!("{} keys installed with {}", role, peer);
                    self.observer.handshake_complete(role, peer, &keys);
                }
                Action::InstallGroup { gtk, .. } => {
                    self.observer.group_keys_installed(role, peer, &gtk)
                }
                Action::GroupRekeyComplete => {
                    if let Some(group) = &self.group {
                        let mut group = group.lock().await;
                        self.observer.group_keys_installed(role, peer, group.gtk());
                        if group.mark_done(peer) {
                            self.observer.group_rekey_complete(group.gtk().index);
                        }
                    }
                }
                Action::GroupRekeyRequested => self.post(Event::GroupRekey),
                Action::PairwiseRekeyRequested => self.post(Event::PairwiseRekey { peer }),
                Action::MicFailureReported { count } => {
                    if count >= 2 {
                        warn!("Repeated MIC failures from {}, deauthenticating", peer);
                        entry.cancel_timers();
                        self.post_teardown(peer, Teardown::Failure(ReasonCode::MichaelMicFailure));
                    }
                }
            }
        }
    }

    async fn on_timer(&self, peer: MacAddr, kind: TimerKind, generation: u64) {
        let Some(entry) = self.peer(peer).await else {
            debug!("{:?} timer for {} fired after teardown", kind, peer);
            return;
        };
        let mut entry = entry.lock().await;
        if !entry.slot(kind).take_expiry(generation) {
            debug!("Stale {:?} timer for {} ignored", kind, peer);
            return;
        }
        match kind {
            TimerKind::Resend => {
                let Some(session) = entry.session.as_mut() else {
                    return;
                };
                let result = session.on_timeout();
                self.apply(peer, &mut entry, result).await;
            }
            TimerKind::SaeRetransmit => self.on_sae_retransmit(peer, &mut entry),
            TimerKind::SaeAuth => {
                if entry.sae_pending() {
                    warn!("SAE with {} timed out", peer);
                    entry.cancel_timers();
                    self.post_teardown(peer, Teardown::Failure(ReasonCode::Unspecified));
                }
            }
        }
    }

    fn on_sae_retransmit(&self, peer: MacAddr, entry: &mut Peer) {
        let Some(sae) = entry.sae.as_mut() else {
            return;
        };
        match sae.on_timeout() {
            Ok(Some(msg)) => {
                self.lower.send_auth(self.own(), peer, msg.encode());
                entry.sae_retransmit.arm(
                    self.settings.sae.retrans_timeout,
                    peer,
                    TimerKind::SaeRetransmit,
                    &self.timers,
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!("SAE with {} abandoned: {}", peer, e);
                entry.cancel_timers();
                self.post_teardown(peer, Teardown::Failure(ReasonCode::Unspecified));
            }
        }
    }

    /// Arm both SAE timers for a fresh exchange
    fn arm_sae(&self, peer: MacAddr, entry: &mut Peer) {
        let sae = &self.settings.sae;
        entry
            .sae_retransmit
            .arm(sae.retrans_timeout, peer, TimerKind::SaeRetransmit, &self.timers);
        if !entry.sae_deadline.is_armed() {
            entry
                .sae_deadline
                .arm(sae.auth_timeout, peer, TimerKind::SaeAuth, &self.timers);
        }
    }

    /// An SAE exchange ended in an error
    fn sae_failed(&self, peer: MacAddr, entry: &mut Peer, transaction: u16, e: HandshakeError) {
        let reason = match e.disposition() {
            Disposition::Drop => {
                debug!("Dropped SAE frame from {}: {}", peer, e);
                return;
            }
            Disposition::Reject(status) => {
                let reply = SaeMessage::Rejected {
                    transaction,
                    status: status as u16,
                };
                self.lower.send_auth(self.own(), peer, reply.encode());
                ReasonCode::Unspecified
            }
            Disposition::Abort(reason) | Disposition::Teardown(reason) => reason,
        };
        warn!("SAE with {} failed: {}", peer, e);
        entry.cancel_timers();
        self.post_teardown(peer, Teardown::Failure(reason));
    }

    /// A completed SAE exchange: cache the PMKSA and keep the PMK for the
    /// coming 4-way handshake
    async fn sae_accepted(&self, peer: MacAddr, entry: &mut Peer, pmk: Pmk, pmkid: Pmkid) {
        entry.sae_retransmit.cancel();
        entry.sae_deadline.cancel();
        self.pmksa.lock().await.insert(peer, pmkid, pmk.clone(), Akm::Sae);
        self.persist_pmksa().await;
        entry.pmk = Some((pmk, Some(pmkid)));
    }

    /// Replace the session with a fresh one and start it
    async fn start_session(
        &self,
        peer: MacAddr,
        entry: &mut Peer,
        config: SessionConfig,
        pmk: Pmk,
        pmkid: Option<Pmkid>,
    ) {
        entry.resend.cancel();
        let mut session = Session::new(config.clone());
        let result = {
            let mut rng = self.rng.lock().await;
            session.begin(pmk, pmkid, rng.as_mut())
        };
        entry.config = Some(config);
        entry.session = Some(session);
        self.apply(peer, entry, result).await;
    }

    async fn on_pmk_ready(&self, peer: MacAddr, pmk: Pmk) {
        let Some(entry) = self.peer(peer).await else {
            warn!("PMK for {} without an association, ignored", peer);
            return;
        };
        let mut entry = entry.lock().await;
        let Some(config) = entry.config.clone() else {
            warn!("PMK for {} before association, ignored", peer);
            return;
        };
        if entry.session.as_ref().map_or(false, |s| s.state() != HandshakeState::Idle) {
            info!("New PMK for {}, starting a new 4-way handshake", peer);
        }
        self.start_session(peer, &mut entry, config, pmk, None).await;
    }

    /// Remove a record; a second teardown of the same peer is a no-op
    async fn teardown(&self, peer: MacAddr, how: Teardown) {
        let removed = self.peers.lock().await.remove(&peer);
        let Some(entry) = removed else {
            debug!("No session with {} to tear down", peer);
            return;
        };
        let mut entry = entry.lock().await;
        entry.cancel_timers();
        let was_member = entry.installed();
        entry.session = None;
        entry.sae = None;
        drop(entry);

        match how {
            Teardown::Quiet => {}
            Teardown::Leave(reason) => self.lower.deauthenticate(self.own(), peer, reason),
            Teardown::Failure(reason) => {
                self.lower.deauthenticate(self.own(), peer, reason);
                self.observer.handshake_failed(self.role(), peer, reason);
            }
        }
        debug!("Session with {} removed", peer);

        if let Some(group) = &self.group {
            let mut group = group.lock().await;
            if group.mark_done(peer) {
                self.observer.group_rekey_complete(group.gtk().index);
            }
            if was_member && self.settings.rekey_on_leave {
                info!("{} left, rotating group keys", peer);
                self.post(Event::GroupRekey);
            }
        }
    }

    async fn persist_pmksa(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut cache = self.pmksa.lock().await;
        cache.expire(chrono::Utc::now());
        if let Err(e) = store.save(cache.entries()) {
            warn!("Failed to persist PMKSA cache: {:#}", e);
        }
    }

    async fn shutdown(&self) {
        let peers: Vec<MacAddr> = self.peers.lock().await.keys().copied().collect();
        for peer in peers {
            let associated = match self.peer(peer).await {
                Some(entry) => entry.lock().await.session.is_some(),
                None => false,
            };
            let how = if associated {
                Teardown::Leave(ReasonCode::DeauthLeaving)
            } else {
                Teardown::Quiet
            };
            self.teardown(peer, how).await;
        }
        info!("{} {} stopped", self.role(), self.own());
    }

    /// Reason code for refusing a peer element, or `None` when a suite
    /// can be negotiated
    fn rejection_reason(&self, peer: &Rsne) -> Option<ReasonCode> {
        let own = &self.advertised;
        if self.settings.policy.select_akm(&peer.akms()).is_none() {
            return Some(ReasonCode::AkmpNotValid);
        }
        let peer_pairwise = peer.pairwise_ciphers();
        if !own.pairwise_ciphers().iter().any(|c| peer_pairwise.contains(c)) {
            return Some(ReasonCode::PairwiseCipherNotValid);
        }
        if peer.group_cipher().is_some() && peer.group_cipher() != own.group_cipher() {
            return Some(ReasonCode::GroupCipherNotValid);
        }
        None
    }

    fn negotiate(&self, peer_ie: &[u8]) -> Result<(Rsne, CipherSuite), ReasonCode> {
        let peer = Rsne::parse(peer_ie).map_err(|e| {
            warn!("Unparseable RSN element: {}", e);
            ReasonCode::InvalidIe
        })?;
        if let Some(reason) = self.rejection_reason(&peer) {
            return Err(reason);
        }
        let suite = CipherSuite::negotiate(
            self.settings.policy,
            &self.advertised,
            &peer,
            self.settings.legacy_wpa,
        )
        .map_err(|e: HandshakeError| {
            warn!("Suite negotiation failed: {}", e);
            ReasonCode::CipherSuiteRejected
        })?;
        Ok((peer, suite))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LoopbackMac;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const AP: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const STA: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
    const STA2: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x03]);
    const PASSPHRASE: &str = "correct horse battery";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Note {
        Started(Role, MacAddr, bool),
        Complete(Role, MacAddr, Option<u8>),
        Failed(Role, MacAddr, ReasonCode),
        GroupInstalled(Role, MacAddr, u8),
        GroupDone(u8),
    }

    struct Recorder(mpsc::UnboundedSender<Note>);

    impl SessionObserver for Recorder {
        fn handshake_started(&self, role: Role, peer: MacAddr, rekey: bool) {
            let _ = self.0.send(Note::Started(role, peer, rekey));
        }
        fn handshake_complete(&self, role: Role, peer: MacAddr, keys: &InstalledKeys) {
            let _ = self
                .0
                .send(Note::Complete(role, peer, keys.gtk.as_ref().map(|g| g.index)));
        }
        fn handshake_failed(&self, role: Role, peer: MacAddr, reason: ReasonCode) {
            let _ = self.0.send(Note::Failed(role, peer, reason));
        }
        fn group_keys_installed(&self, role: Role, peer: MacAddr, gtk: &Gtk) {
            let _ = self.0.send(Note::GroupInstalled(role, peer, gtk.index));
        }
        fn group_rekey_complete(&self, gtk_index: u8) {
            let _ = self.0.send(Note::GroupDone(gtk_index));
        }
    }

    struct Net {
        link: Arc<LoopbackMac>,
        ap: EngineHandle,
        stations: Vec<EngineHandle>,
        notes: mpsc::UnboundedReceiver<Note>,
    }

    fn settings(role: Role, own: MacAddr, policy: SecurityPolicy) -> RoleSettings {
        RoleSettings::new(role, own, policy, b"wpa-lite-lab", PASSPHRASE)
    }

    fn build(
        ap: RoleSettings,
        stations: Vec<RoleSettings>,
        ap_store: Option<Box<dyn PmksaStore>>,
    ) -> Net {
        let link = Arc::new(LoopbackMac::new());
        let (tx, notes) = mpsc::unbounded_channel();
        let observer: Arc<dyn SessionObserver> = Arc::new(Recorder(tx));

        let spawn = |settings: RoleSettings, seed: u64, store: Option<Box<dyn PmksaStore>>| {
            let own = settings.own;
            let engine = Engine::new(
                settings,
                link.clone(),
                observer.clone(),
                Box::new(StdRng::seed_from_u64(seed)),
                store,
            )
            .unwrap();
            let handle = engine.spawn();
            link.attach(own, handle.clone());
            handle
        };
        let ap = spawn(ap, 1, ap_store);
        let stations = stations
            .into_iter()
            .enumerate()
            .map(|(i, s)| spawn(s, 10 + i as u64, None))
            .collect();
        Net {
            link,
            ap,
            stations,
            notes,
        }
    }

    fn pair(policy: SecurityPolicy) -> Net {
        build(
            settings(Role::Authenticator, AP, policy),
            vec![settings(Role::Supplicant, STA, policy)],
            None,
        )
    }

    impl Net {
        fn connect(&self, index: usize) {
            self.stations[index]
                .connect(
                    AP,
                    self.ap.advertised_ie().to_vec(),
                    self.ap.advertised_rsnxe().map(|r| r.to_vec()),
                )
                .unwrap();
        }

        async fn next(&mut self) -> Note {
            timeout(Duration::from_secs(60), self.notes.recv())
                .await
                .expect("no notification in time")
                .expect("observer channel closed")
        }

        /// Skip notifications until `wanted` shows up
        async fn expect(&mut self, wanted: Note) {
            loop {
                if self.next().await == wanted {
                    return;
                }
            }
        }

        async fn both_complete(&mut self, sta: MacAddr) {
            let mut ap_done = false;
            let mut sta_done = false;
            while !(ap_done && sta_done) {
                match self.next().await {
                    Note::Complete(Role::Authenticator, peer, _) if peer == sta => ap_done = true,
                    Note::Complete(Role::Supplicant, peer, _) if peer == AP => sta_done = true,
                    Note::Failed(role, peer, reason) => {
                        panic!("{} handshake with {} failed: {}", role, peer, reason)
                    }
                    _ => {}
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_psk_association_installs_keys_on_both_sides() {
        let mut net = pair(SecurityPolicy::Wpa2Psk);
        net.connect(0);
        net.expect(Note::Started(Role::Authenticator, STA, false)).await;
        net.both_complete(STA).await;

        assert_eq!(net.ap.state(STA).await, Some(HandshakeState::PtkInitDone));
        assert_eq!(net.stations[0].state(AP).await, Some(HandshakeState::PtkInitDone));
        assert!(!net.ap.uses_pmksa(STA).await);
        net.ap.shutdown().await;
        net.stations[0].shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_rekey_reaches_every_station() {
        let ap = settings(Role::Authenticator, AP, SecurityPolicy::Wpa2Psk);
        let stas = vec![
            settings(Role::Supplicant, STA, SecurityPolicy::Wpa2Psk),
            settings(Role::Supplicant, STA2, SecurityPolicy::Wpa2Psk),
        ];
        let mut net = build(ap, stas, None);
        net.connect(0);
        net.both_complete(STA).await;
        net.connect(1);
        net.both_complete(STA2).await;

        assert_ok!(net.ap.group_rekey());
        net.expect(Note::GroupDone(2)).await;
        assert_eq!(net.ap.current_gtk().await.unwrap().index, 2);
        assert_eq!(net.ap.state(STA).await, Some(HandshakeState::RekeyEstablished));
        assert_eq!(net.ap.state(STA2).await, Some(HandshakeState::RekeyEstablished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_replies_exhaust_authenticator_retries() {
        let mut net = pair(SecurityPolicy::Wpa2Psk);
        net.link.drop_eapol_from(STA);
        net.connect(0);

        net.expect(Note::Failed(
            Role::Authenticator,
            STA,
            ReasonCode::FourWayHandshakeTimeout,
        ))
        .await;
        // message 1 plus three retransmissions
        assert_eq!(net.link.eapol_sent(AP), 4);
        assert!(net.ap.peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sae_then_pmksa_reassociation_skips_sae() {
        let mut net = pair(SecurityPolicy::Wpa3Sae);
        net.connect(0);
        net.both_complete(STA).await;
        assert_eq!(net.ap.pmksa_len().await, 1);
        assert_eq!(net.stations[0].pmksa_len().await, 1);
        assert!(net.ap.uses_pmksa(STA).await);
        let auth_frames = net.link.auth_sent(STA);
        assert!(auth_frames >= 2);

        net.stations[0].disassociated(AP).unwrap();
        net.ap.disassociated(STA).unwrap();
        net.connect(0);
        net.both_complete(STA).await;
        assert_eq!(net.link.auth_sent(STA), auth_frames);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sae_wrong_password_fails_without_keys() {
        let ap = settings(Role::Authenticator, AP, SecurityPolicy::Wpa3Sae);
        let mut sta = settings(Role::Supplicant, STA, SecurityPolicy::Wpa3Sae);
        sta.passphrase = "not the password".to_string();
        let mut net = build(ap, vec![sta], None);
        net.connect(0);

        loop {
            match net.next().await {
                Note::Failed(_, _, _) => break,
                Note::Complete(..) => panic!("keys installed with the wrong password"),
                _ => {}
            }
        }
        assert_eq!(net.ap.pmksa_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_rekey_request_and_leave_rotate_group_keys() {
        let mut ap = settings(Role::Authenticator, AP, SecurityPolicy::Wpa2Psk);
        ap.rekey_on_leave = true;
        let stas = vec![
            settings(Role::Supplicant, STA, SecurityPolicy::Wpa2Psk),
            settings(Role::Supplicant, STA2, SecurityPolicy::Wpa2Psk),
        ];
        let mut net = build(ap, stas, None);
        net.connect(0);
        net.both_complete(STA).await;
        net.connect(1);
        net.both_complete(STA2).await;

        assert_ok!(net.stations[0].request_rekey(AP, false));
        net.expect(Note::GroupDone(2)).await;

        net.ap.disassociated(STA2).unwrap();
        net.expect(Note::GroupDone(1)).await;
        assert_eq!(net.ap.peers().await, vec![STA]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairwise_rekey_keeps_session() {
        let mut net = pair(SecurityPolicy::Wpa2PskSha256);
        net.connect(0);
        net.both_complete(STA).await;

        assert_ok!(net.ap.pairwise_rekey(STA));
        net.expect(Note::Started(Role::Authenticator, STA, true)).await;
        net.both_complete(STA).await;
        assert_eq!(net.ap.state(STA).await, Some(HandshakeState::PtkInitDone));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent_and_cancels_timers() {
        let mut net = pair(SecurityPolicy::Wpa2Psk);
        net.link.drop_eapol_from(STA);
        net.connect(0);
        net.expect(Note::Started(Role::Authenticator, STA, false)).await;

        net.ap.disassociated(STA).unwrap();
        net.ap.disassociated(STA).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(net.ap.peers().await.is_empty());
        // the pending resend timer died with the session
        assert_eq!(net.link.eapol_sent(AP), 1);
        while let Ok(note) = net.notes.try_recv() {
            assert!(!matches!(note, Note::Failed(Role::Authenticator, ..)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_from_a_replaced_session_is_ignored() {
        let link = Arc::new(LoopbackMac::new());
        let (tx, _notes) = mpsc::unbounded_channel();
        let Engine { ctx, mut events } = Engine::new(
            settings(Role::Authenticator, AP, SecurityPolicy::Wpa2Psk),
            link.clone(),
            Arc::new(Recorder(tx)),
            Box::new(StdRng::seed_from_u64(1)),
            None,
        )
        .unwrap();
        let sta_ie = settings(Role::Supplicant, STA, SecurityPolicy::Wpa2Psk)
            .advertised_rsne()
            .encode();

        ctx.on_associated(STA, sta_ie.clone(), None).await;
        assert_eq!(link.eapol_sent(AP), 1);
        // fires while the leave and the new association are still queued
        let stale = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(stale, Event::Timeout { kind: TimerKind::Resend, .. }));

        ctx.teardown(STA, Teardown::Quiet).await;
        ctx.on_associated(STA, sta_ie, None).await;
        assert_eq!(link.eapol_sent(AP), 2);

        ctx.handle(stale).await;
        assert_eq!(link.eapol_sent(AP), 2);
        assert!(ctx.peer(STA).await.unwrap().lock().await.resend.is_armed());

        let current = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        ctx.handle(current).await;
        assert_eq!(link.eapol_sent(AP), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_policy_is_refused() {
        let ap = settings(Role::Authenticator, AP, SecurityPolicy::Wpa3Sae);
        let sta = settings(Role::Supplicant, STA, SecurityPolicy::Wpa2Psk);
        let mut net = build(ap, vec![sta], None);
        net.connect(0);
        net.expect(Note::Failed(Role::Supplicant, AP, ReasonCode::AkmpNotValid))
            .await;
        assert!(net.stations[0].peers().await.is_empty());
    }
}
