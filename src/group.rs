//! Group key manager: one GTK/IGTK lifecycle per BSS
//!
//! The context is owned by the authenticator role. A rekey derives a new
//! GTK under the other key index (1 and 2 alternate), a new IGTK under the
//! other IGTK index (4 and 5 alternate), and tracks which stations still
//! have to acknowledge the new keys with group message 2.

use std::collections::HashSet;

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::eapol::kde::KeyDataBuilder;
use crate::error::{HandshakeError, Result};
use crate::keys::{derive_gtk, derive_igtk, Gtk, Igtk};
use crate::suite::CipherSuite;
use crate::types::{MacAddr, Nonce, SecureRng};

/// IGTK packet numbers are 48 bits wide
pub const IPN_MAX: u64 = (1 << 48) - 1;

pub struct GroupKeyContext {
    aa: MacAddr,
    suite: CipherSuite,
    gmk: Zeroizing<[u8; 32]>,
    gnonce: Nonce,
    gtk: Gtk,
    igtk: Option<Igtk>,
    /// RSN or WPA element advertised by the BSS, copied into message 3
    ie: Vec<u8>,
    rsnxe: Option<Vec<u8>>,
    rekey_in_progress: bool,
    pending: HashSet<MacAddr>,
}

impl std::fmt::Debug for GroupKeyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyContext")
            .field("aa", &self.aa)
            .field("gtk", &self.gtk)
            .field("igtk", &self.igtk)
            .field("rekey_in_progress", &self.rekey_in_progress)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn increment(nonce: &mut Nonce) {
    for b in nonce.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

impl GroupKeyContext {
    /// Bring up the group keys of a BSS
    ///
    /// `suite` is the BSS-wide suite: its group cipher sizes the GTK and its
    /// management group cipher, when present, enables the IGTK.
    pub fn new(
        aa: MacAddr,
        suite: CipherSuite,
        ie: Vec<u8>,
        rsnxe: Option<Vec<u8>>,
        rng: &mut dyn SecureRng,
    ) -> Result<Self> {
        let mut gmk = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut gmk[..]);
        let mut gnonce = [0u8; 32];
        rng.fill_bytes(&mut gnonce);

        let gtk_bytes = derive_gtk(&gmk[..], aa, &gnonce, &suite)?;
        let gtk = Gtk::new(&gtk_bytes, 1, true);
        let igtk = match suite.group_mgmt {
            Some(_) => {
                let igtk_bytes = derive_igtk(&gmk[..], aa, &gnonce, &suite)?;
                Some(Igtk::new(&igtk_bytes, 4, 0))
            }
            None => None,
        };
        debug!("Group keys up for {}: GTK index {}", aa, gtk.index);

        Ok(Self {
            aa,
            suite,
            gmk,
            gnonce,
            gtk,
            igtk,
            ie,
            rsnxe,
            rekey_in_progress: false,
            pending: HashSet::new(),
        })
    }

    pub fn gtk(&self) -> &Gtk {
        &self.gtk
    }

    pub fn igtk(&self) -> Option<&Igtk> {
        self.igtk.as_ref()
    }

    pub fn ie(&self) -> &[u8] {
        &self.ie
    }

    pub fn rsnxe(&self) -> Option<&[u8]> {
        self.rsnxe.as_deref()
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    pub fn rekey_in_progress(&self) -> bool {
        self.rekey_in_progress
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Rotate GTK (and IGTK) and wait for `members` to acknowledge
    ///
    /// A rekey started while another is still pending supersedes it: the
    /// new keys replace the old ones and the pending set is reset.
    pub fn begin_rekey(&mut self, members: impl IntoIterator<Item = MacAddr>) -> Result<()> {
        increment(&mut self.gnonce);
        let index = if self.gtk.index == 1 { 2 } else { 1 };
        let gtk_bytes = derive_gtk(&self.gmk[..], self.aa, &self.gnonce, &self.suite)?;
        self.gtk = Gtk::new(&gtk_bytes, index, true);

        if let Some(old) = &self.igtk {
            let index = if old.index == 4 { 5 } else { 4 };
            let igtk_bytes = derive_igtk(&self.gmk[..], self.aa, &self.gnonce, &self.suite)?;
            self.igtk = Some(Igtk::new(&igtk_bytes, index, 0));
        }

        self.pending = members.into_iter().collect();
        self.rekey_in_progress = !self.pending.is_empty();
        info!(
            "Group rekey: GTK index {}, {} station(s) to update",
            self.gtk.index,
            self.pending.len()
        );
        Ok(())
    }

    /// Record that `peer` installed the current group keys (or left).
    /// Returns true when this completes the rekey.
    pub fn mark_done(&mut self, peer: MacAddr) -> bool {
        if !self.pending.remove(&peer) || !self.pending.is_empty() {
            return false;
        }
        let finished = self.rekey_in_progress;
        self.rekey_in_progress = false;
        if finished {
            info!("Group rekey complete: GTK index {}", self.gtk.index);
        }
        finished
    }

    /// Next IGTK packet number for a protected broadcast management frame
    pub fn next_ipn(&mut self) -> Result<u64> {
        let igtk = self.igtk.as_mut().ok_or(HandshakeError::InvalidState {
            operation: "next IPN",
            state: "no IGTK",
        })?;
        if igtk.ipn >= IPN_MAX {
            return Err(HandshakeError::Crypto("IGTK packet number exhausted".to_string()));
        }
        igtk.ipn += 1;
        Ok(igtk.ipn)
    }

    /// Plaintext GTK/IGTK key data for message 3 and group message 1
    ///
    /// The WPA descriptor carries the bare GTK; RSN carries KDEs.
    pub fn key_data(&self, legacy_wpa: bool) -> Zeroizing<Vec<u8>> {
        if legacy_wpa {
            return Zeroizing::new(self.gtk.key().to_vec());
        }
        let mut builder = KeyDataBuilder::new().gtk(self.gtk.index, self.gtk.tx, self.gtk.key());
        if let Some(igtk) = &self.igtk {
            builder = builder.igtk(igtk.index, igtk.ipn, igtk.key());
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eapol::kde::KeyData;
    use crate::eapol::key_info::DescriptorType;
    use crate::suite::{Akm, Cipher};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn context(mgmt: bool) -> GroupKeyContext {
        let suite = CipherSuite::new(
            Akm::Psk,
            Cipher::Ccmp128,
            Cipher::Ccmp128,
            mgmt.then_some(Cipher::BipCmac128),
            DescriptorType::Rsn,
            false,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        GroupKeyContext::new(MacAddr([2, 0, 0, 0, 0, 1]), suite, vec![48, 0], None, &mut rng).unwrap()
    }

    #[test]
    fn test_rekey_alternates_indices_and_changes_keys() {
        let mut ctx = context(true);
        let first = ctx.gtk().clone();
        assert_eq!(first.index, 1);
        assert_eq!(ctx.igtk().unwrap().index, 4);

        ctx.begin_rekey([MacAddr([2, 0, 0, 0, 0, 9])]).unwrap();
        assert_eq!(ctx.gtk().index, 2);
        assert_eq!(ctx.igtk().unwrap().index, 5);
        assert_ne!(ctx.gtk().key(), first.key());

        ctx.begin_rekey(Vec::new()).unwrap();
        assert_eq!(ctx.gtk().index, 1);
        assert!(!ctx.rekey_in_progress());
    }

    #[test]
    fn test_rekey_completes_when_all_members_ack() {
        let mut ctx = context(false);
        let a = MacAddr([2, 0, 0, 0, 0, 0xa]);
        let b = MacAddr([2, 0, 0, 0, 0, 0xb]);
        ctx.begin_rekey([a, b]).unwrap();
        assert!(ctx.rekey_in_progress());
        assert!(!ctx.mark_done(a));
        assert!(!ctx.mark_done(a));
        assert!(ctx.mark_done(b));
        assert!(!ctx.rekey_in_progress());
    }

    #[test]
    fn test_ipn_is_monotonic_and_bounded() {
        let mut ctx = context(true);
        let first = ctx.next_ipn().unwrap();
        let second = ctx.next_ipn().unwrap();
        assert!(second > first);

        if let Some(igtk) = ctx.igtk.as_mut() {
            igtk.ipn = IPN_MAX;
        }
        assert!(ctx.next_ipn().is_err());
        assert!(context(false).next_ipn().is_err());
    }

    #[test]
    fn test_key_data_carries_gtk_and_igtk() {
        let ctx = context(true);
        let data = KeyData::parse(&ctx.key_data(false)).unwrap();
        let gtk = data.gtk().unwrap();
        assert_eq!(gtk.key_id, 1);
        assert_eq!(&gtk.gtk[..], ctx.gtk().key());
        assert_eq!(data.igtk().unwrap().key_id, 4);

        assert_eq!(&ctx.key_data(true)[..], ctx.gtk().key());
    }
}
