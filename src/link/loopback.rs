use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use tracing::{debug, info};

use crate::engine::{EngineHandle, LowerMac};
use crate::error::ReasonCode;
use crate::types::MacAddr;

#[derive(Default)]
struct Station {
    handle: Option<EngineHandle>,
    eapol_sent: usize,
    auth_sent: usize,
    drop_eapol: bool,
}

/// Delivers frames between engines attached to the same process
///
/// Every frame goes straight into the destination engine's event queue, so
/// delivery order per sender is preserved. Attached engines keep the link
/// alive; `detach` breaks the cycle when an engine is retired.
#[derive(Default)]
pub struct LoopbackMac {
    stations: RwLock<HashMap<MacAddr, Station>>,
}

impl LoopbackMac {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route frames addressed to `mac` into `handle`
    pub fn attach(&self, mac: MacAddr, handle: EngineHandle) {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        stations.entry(mac).or_default().handle = Some(handle);
        info!("Attached {} to the loopback link", mac);
    }

    pub fn detach(&self, mac: MacAddr) {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(station) = stations.get_mut(&mac) {
            station.handle = None;
        }
    }

    /// Silently lose every EAPOL frame `mac` transmits from now on
    pub fn drop_eapol_from(&self, mac: MacAddr) {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        stations.entry(mac).or_default().drop_eapol = true;
    }

    /// EAPOL frames transmitted by `mac`, lost ones included
    pub fn eapol_sent(&self, mac: MacAddr) -> usize {
        let stations = self.stations.read().unwrap_or_else(|e| e.into_inner());
        stations.get(&mac).map_or(0, |s| s.eapol_sent)
    }

    /// SAE authentication frames transmitted by `mac`
    pub fn auth_sent(&self, mac: MacAddr) -> usize {
        let stations = self.stations.read().unwrap_or_else(|e| e.into_inner());
        stations.get(&mac).map_or(0, |s| s.auth_sent)
    }

    fn target(&self, to: MacAddr) -> Option<EngineHandle> {
        let stations = self.stations.read().unwrap_or_else(|e| e.into_inner());
        let handle = stations.get(&to).and_then(|s| s.handle.clone());
        if handle.is_none() {
            debug!("Nothing attached at {}, frame lost", to);
        }
        handle
    }

    fn deliver<F>(&self, from: MacAddr, to: MacAddr, what: &str, post: F)
    where
        F: FnOnce(&EngineHandle) -> anyhow::Result<()>,
    {
        if let Some(handle) = self.target(to) {
            if let Err(e) = post(&handle) {
                debug!("{} from {} to {} not delivered: {}", what, from, to, e);
            }
        }
    }
}

impl LowerMac for LoopbackMac {
    fn send_eapol(&self, own: MacAddr, peer: MacAddr, frame: Bytes) {
        let dropped = {
            let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
            let station = stations.entry(own).or_default();
            station.eapol_sent += 1;
            station.drop_eapol
        };
        if dropped {
            debug!("EAPOL {} -> {} lost ({} bytes)", own, peer, frame.len());
            return;
        }
        self.deliver(own, peer, "EAPOL frame", |h| h.deliver_eapol(own, frame));
    }

    fn send_auth(&self, own: MacAddr, peer: MacAddr, frame: Bytes) {
        {
            let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
            stations.entry(own).or_default().auth_sent += 1;
        }
        self.deliver(own, peer, "SAE frame", |h| h.deliver_auth(own, frame));
    }

    fn associate(&self, own: MacAddr, bssid: MacAddr, ie: Vec<u8>, rsnxe: Option<Vec<u8>>) {
        self.deliver(own, bssid, "Association request", |h| h.associated(own, ie, rsnxe));
    }

    fn deauthenticate(&self, own: MacAddr, peer: MacAddr, reason: ReasonCode) {
        debug!("{} deauthenticating {} ({})", own, peer, reason);
        self.deliver(own, peer, "Deauthentication", |h| h.disassociated(own));
    }
}
