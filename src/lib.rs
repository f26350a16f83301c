//! wpa-lite: link-security handshake engine
//!
//! The 802.11 4-way and group-key handshakes, SAE (WPA3-Personal), PMKSA
//! caching and group key rotation, with a tokio engine driving one session
//! per peer.

pub mod config;
pub mod eapol;
pub mod engine;
pub mod error;
pub mod governor;
pub mod group;
pub mod handshake;
pub mod keys;
pub mod link;
pub mod pmksa;
pub mod sae;
pub mod suite;
pub mod types;
