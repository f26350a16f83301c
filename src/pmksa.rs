//! PMKSA cache
//!
//! Maps (peer, PMKID) to a cached PMK so a reassociating station can skip
//! credential derivation. A cache hit never skips the 4-way handshake: it
//! only supplies the PMK the handshake starts from.

use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::keys::Pmk;
use crate::suite::Akm;
use crate::types::{MacAddr, Pmkid};

/// One cached security association
#[derive(Debug, Clone)]
pub struct PmksaEntry {
    pub peer: MacAddr,
    pub pmkid: Pmkid,
    pub pmk: Pmk,
    pub akm: Akm,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PmksaCache {
    entries: Vec<PmksaEntry>,
    lifetime: Duration,
    capacity: usize,
}

impl PmksaCache {
    pub const DEFAULT_LIFETIME_SECS: i64 = 43200;
    pub const DEFAULT_CAPACITY: usize = 32;

    pub fn new(lifetime: Duration, capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            lifetime,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, peer: MacAddr, pmkid: &Pmkid) -> Option<&Pmk> {
        self.lookup_at(peer, pmkid, Utc::now())
    }

    pub fn lookup_at(&self, peer: MacAddr, pmkid: &Pmkid, now: DateTime<Utc>) -> Option<&Pmk> {
        self.entries
            .iter()
            .find(|e| e.peer == peer && e.pmkid == *pmkid && e.expires > now)
            .map(|e| &e.pmk)
    }

    /// Most recent live entry for a peer, used by a station choosing which
    /// PMKID to offer
    pub fn entry_for(&self, peer: MacAddr) -> Option<&PmksaEntry> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| e.peer == peer && e.expires > now)
            .max_by_key(|e| e.created)
    }

    pub fn insert(&mut self, peer: MacAddr, pmkid: Pmkid, pmk: Pmk, akm: Akm) {
        self.insert_at(peer, pmkid, pmk, akm, Utc::now());
    }

    /// Add an entry, replacing any earlier one for the same peer. Expired
    /// entries go first; the oldest live one is evicted if the cache is
    /// still full.
    pub fn insert_at(&mut self, peer: MacAddr, pmkid: Pmkid, pmk: Pmk, akm: Akm, now: DateTime<Utc>) {
        self.entries.retain(|e| e.peer != peer);
        self.expire(now);
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.created)
                .map(|(i, _)| i)
            {
                let evicted = self.entries.remove(oldest);
                debug!("PMKSA cache full, evicted entry for {}", evicted.peer);
            }
        }
        debug!("PMKSA cached for {} (PMKID {})", peer, pmkid);
        self.entries.push(PmksaEntry {
            peer,
            pmkid,
            pmk,
            akm,
            created: now,
            expires: now + self.lifetime,
        });
    }

    pub fn remove(&mut self, peer: MacAddr, pmkid: &Pmkid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.peer == peer && e.pmkid == *pmkid));
        before != self.entries.len()
    }

    /// Drop every entry for `peer`, or the whole cache. Returns how many
    /// entries went.
    pub fn flush(&mut self, peer: Option<MacAddr>) -> usize {
        let before = self.entries.len();
        match peer {
            Some(peer) => self.entries.retain(|e| e.peer != peer),
            None => self.entries.clear(),
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            info!("PMKSA flush removed {} entr{}", removed, if removed == 1 { "y" } else { "ies" });
        }
        removed
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.expires > now);
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!("PMKSA cache dropped {} expired entr{}", expired, if expired == 1 { "y" } else { "ies" });
        }
        expired
    }

    pub fn entries(&self) -> &[PmksaEntry] {
        &self.entries
    }

    /// Restore entries loaded from a store, dropping expired ones
    pub fn restore(&mut self, entries: Vec<PmksaEntry>) {
        let now = Utc::now();
        for entry in entries.into_iter().filter(|e| e.expires > now) {
            self.entries.retain(|e| e.peer != entry.peer);
            self.entries.push(entry);
        }
        while self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }
}

impl Default for PmksaCache {
    fn default() -> Self {
        Self::new(
            Duration::seconds(Self::DEFAULT_LIFETIME_SECS),
            Self::DEFAULT_CAPACITY,
        )
    }
}

/// Persistent storage for PMKSA entries across restarts
pub trait PmksaStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<PmksaEntry>>;
    fn save(&self, entries: &[PmksaEntry]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    peer: MacAddr,
    pmkid: String,
    /// Base64
    pmk: String,
    akm: Akm,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
}

impl StoredEntry {
    fn from_entry(entry: &PmksaEntry) -> Self {
        Self {
            peer: entry.peer,
            pmkid: hex::encode(entry.pmkid.0),
            pmk: BASE64.encode(entry.pmk.as_bytes()),
            akm: entry.akm,
            created: entry.created,
            expires: entry.expires,
        }
    }

    fn into_entry(self) -> anyhow::Result<PmksaEntry> {
        let pmkid: [u8; 16] = hex::decode(&self.pmkid)
            .context("PMKID is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("PMKID must be 16 bytes"))?;
        let pmk_bytes = zeroize::Zeroizing::new(BASE64.decode(&self.pmk).context("PMK is not base64")?);
        let pmk = Pmk::new(&pmk_bytes).map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(PmksaEntry {
            peer: self.peer,
            pmkid: Pmkid(pmkid),
            pmk,
            akm: self.akm,
            created: self.created,
            expires: self.expires,
        })
    }
}

/// JSON file holding the cache
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PmksaStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<Vec<PmksaEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read PMKSA store {:?}", self.path))?;
        let stored: Vec<StoredEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse PMKSA store {:?}", self.path))?;

        let mut entries = Vec::with_capacity(stored.len());
        for item in stored {
            match item.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping PMKSA store entry: {}", e),
            }
        }
        Ok(entries)
    }

    fn save(&self, entries: &[PmksaEntry]) -> anyhow::Result<()> {
        let stored: Vec<StoredEntry> = entries.iter().map(StoredEntry::from_entry).collect();
        let json = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write PMKSA store {:?}", self.path))?;
        debug!("Saved {} PMKSA entries to {:?}", stored.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> MacAddr {
        MacAddr([2, 0, 0, 0, 0, n])
    }

    fn pmk(fill: u8) -> Pmk {
        Pmk::new(&[fill; 32]).unwrap()
    }

    #[test]
    fn test_insert_lookup_flush() {
        let mut cache = PmksaCache::default();
        let id = Pmkid([0x42; 16]);
        cache.insert(peer(1), id, pmk(7), Akm::Psk);

        assert_eq!(cache.lookup(peer(1), &id), Some(&pmk(7)));
        assert!(cache.lookup(peer(2), &id).is_none());
        assert!(cache.lookup(peer(1), &Pmkid([0; 16])).is_none());

        assert_eq!(cache.flush(Some(peer(1))), 1);
        assert!(cache.lookup(peer(1), &id).is_none());
    }

    #[test]
    fn test_flush_all_and_remove() {
        let mut cache = PmksaCache::default();
        cache.insert(peer(1), Pmkid([1; 16]), pmk(1), Akm::Sae);
        cache.insert(peer(2), Pmkid([2; 16]), pmk(2), Akm::Sae);
        assert!(cache.remove(peer(2), &Pmkid([2; 16])));
        assert!(!cache.remove(peer(2), &Pmkid([2; 16])));
        assert_eq!(cache.flush(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = PmksaCache::new(Duration::seconds(60), 4);
        let t0 = Utc::now();
        let id = Pmkid([3; 16]);
        cache.insert_at(peer(1), id, pmk(3), Akm::Psk, t0);
        assert!(cache.lookup_at(peer(1), &id, t0 + Duration::seconds(59)).is_some());
        assert!(cache.lookup_at(peer(1), &id, t0 + Duration::seconds(60)).is_none());
        assert_eq!(cache.expire(t0 + Duration::seconds(61)), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_and_peer_replaces() {
        let mut cache = PmksaCache::new(Duration::seconds(600), 2);
        let t0 = Utc::now();
        cache.insert_at(peer(1), Pmkid([1; 16]), pmk(1), Akm::Psk, t0);
        cache.insert_at(peer(2), Pmkid([2; 16]), pmk(2), Akm::Psk, t0 + Duration::seconds(1));
        cache.insert_at(peer(3), Pmkid([3; 16]), pmk(3), Akm::Psk, t0 + Duration::seconds(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup_at(peer(1), &Pmkid([1; 16]), t0).is_none());

        cache.insert_at(peer(2), Pmkid([9; 16]), pmk(9), Akm::Psk, t0 + Duration::seconds(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup_at(peer(2), &Pmkid([2; 16]), t0).is_none());
        assert!(cache.lookup_at(peer(2), &Pmkid([9; 16]), t0).is_some());
    }

    #[test]
    fn test_insert_drops_expired_entries_before_evicting() {
        let mut cache = PmksaCache::new(Duration::seconds(3600), 3);
        let t0 = Utc::now();
        cache.insert_at(peer(1), Pmkid([1; 16]), pmk(1), Akm::Sae, t0);
        cache.insert_at(peer(2), Pmkid([2; 16]), pmk(2), Akm::Sae, t0 + Duration::minutes(2));
        cache.insert_at(peer(3), Pmkid([3; 16]), pmk(3), Akm::Sae, t0 + Duration::minutes(50));

        let later = t0 + Duration::minutes(65);
        cache.insert_at(peer(4), Pmkid([4; 16]), pmk(4), Akm::Sae, later);
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup_at(peer(3), &Pmkid([3; 16]), later).is_some());
        assert!(cache.lookup_at(peer(4), &Pmkid([4; 16]), later).is_some());
    }

    #[test]
    fn test_json_store_roundtrip() {
        let path = std::env::temp_dir().join(format!("wpa-lite-pmksa-{}.json", std::process::id()));
        let store = JsonFileStore::new(&path);
        let mut cache = PmksaCache::default();
        cache.insert(peer(5), Pmkid([5; 16]), pmk(5), Akm::Sae);
        store.save(cache.entries()).unwrap();

        let mut restored = PmksaCache::default();
        restored.restore(store.load().unwrap());
        assert_eq!(restored.lookup(peer(5), &Pmkid([5; 16])), Some(&pmk(5)));
        assert_eq!(restored.entries()[0].akm, Akm::Sae);

        std::fs::remove_file(&path).unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
