use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{RoleSettings, SaeSettings};
use crate::governor::RetryPolicy;
use crate::sae::group::PweMethod;
use crate::sae::{H2eMode, SaeParams};
use crate::suite::{Cipher, Pmf, SecurityPolicy};
use crate::types::{MacAddr, Role};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub security: SecurityConfig,
    pub handshake: HandshakeConfig,
    pub sae: SaeConfig,
    pub pmksa: PmksaConfig,
    pub link: LinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub policy: SecurityPolicy,
    pub ssid: String,
    pub passphrase: String,
    /// Overrides the policy's default pairwise cipher
    pub pairwise_cipher: Option<Cipher>,
    pub group_cipher: Option<Cipher>,
    pub pmf: Pmf,
    pub legacy_wpa: bool,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("policy", &self.policy)
            .field("ssid", &self.ssid)
            .field("pairwise_cipher", &self.pairwise_cipher)
            .field("group_cipher", &self.group_cipher)
            .field("pmf", &self.pmf)
            .field("legacy_wpa", &self.legacy_wpa)
            .finish_non_exhaustive()
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::Wpa2Psk,
            ssid: "wpa-lite".to_string(),
            passphrase: "change this passphrase".to_string(),
            pairwise_cipher: None,
            group_cipher: None,
            pmf: Pmf::Optional,
            legacy_wpa: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub authenticator_retries: u32,
    pub supplicant_retries: u32,
    pub first_timeout_ms: u64,
    pub retry_timeout_ms: u64,
    /// 0 disables the periodic group rekey
    pub group_rekey_interval_secs: u64,
    pub rekey_on_leave: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            authenticator_retries: RetryPolicy::AUTHENTICATOR_RETRIES,
            supplicant_retries: RetryPolicy::SUPPLICANT_RETRIES,
            first_timeout_ms: 100,
            retry_timeout_ms: 1000,
            group_rekey_interval_secs: 3600,
            rekey_on_leave: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaeConfig {
    pub groups: Vec<u16>,
    pub h2e: H2eMode,
    pub anti_clogging_threshold: usize,
    pub sync_max: u32,
    pub retrans_timeout_ms: u64,
    pub auth_timeout_ms: u64,
}

impl Default for SaeConfig {
    fn default() -> Self {
        let settings = SaeSettings::default();
        Self {
            groups: settings.params.groups,
            h2e: settings.h2e,
            anti_clogging_threshold: settings.anti_clogging_threshold,
            sync_max: settings.params.sync_max,
            retrans_timeout_ms: settings.retrans_timeout.as_millis() as u64,
            auth_timeout_ms: settings.auth_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PmksaConfig {
    pub lifetime_secs: u64,
    pub capacity: usize,
    /// JSON file the cache is persisted to
    pub store_path: Option<PathBuf>,
}

impl Default for PmksaConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: 43200,
            capacity: 32,
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ap_mac: MacAddr,
    pub sta_mac: MacAddr,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ap_mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            sta_mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Settings for one role of the simulated link
    ///
    /// The supplicant waits `retry_timeout_ms` for its first message too;
    /// `first_timeout_ms` only shortens the authenticator's first wait.
    pub fn role_settings(&self, role: Role) -> anyhow::Result<RoleSettings> {
        let sec = &self.security;
        if sec.policy.uses_passphrase() && !(8..=63).contains(&sec.passphrase.len()) {
            anyhow::bail!("Passphrase must be 8..63 characters");
        }
        if sec.ssid.is_empty() || sec.ssid.len() > 32 {
            anyhow::bail!("SSID must be 1..32 bytes, got {}", sec.ssid.len());
        }
        let own = match role {
            Role::Authenticator => self.link.ap_mac,
            Role::Supplicant => self.link.sta_mac,
        };

        let mut settings =
            RoleSettings::new(role, own, sec.policy, sec.ssid.as_bytes(), &sec.passphrase);
        if let Some(cipher) = sec.pairwise_cipher {
            settings.pairwise = vec![cipher];
        }
        if let Some(cipher) = sec.group_cipher {
            settings.group = cipher;
        }
        settings.pmf = sec.pmf;
        settings.legacy_wpa = sec.legacy_wpa;

        let hs = &self.handshake;
        let retry_timeout = Duration::from_millis(hs.retry_timeout_ms);
        settings.retry = match role {
            Role::Authenticator => RetryPolicy {
                max_retries: hs.authenticator_retries,
                first_timeout: Duration::from_millis(hs.first_timeout_ms),
                retry_timeout,
            },
            Role::Supplicant => RetryPolicy {
                max_retries: hs.supplicant_retries,
                first_timeout: retry_timeout,
                retry_timeout,
            },
        };
        settings.group_rekey_interval =
            (hs.group_rekey_interval_secs > 0).then(|| Duration::from_secs(hs.group_rekey_interval_secs));
        settings.rekey_on_leave = hs.rekey_on_leave;

        let sae = &self.sae;
        if sae.groups.is_empty() {
            anyhow::bail!("At least one SAE group must be configured");
        }
        settings.sae = SaeSettings {
            params: SaeParams {
                groups: sae.groups.clone(),
                pwe: match sae.h2e {
                    H2eMode::Required => PweMethod::HashToElement,
                    H2eMode::Disabled | H2eMode::Enabled => PweMethod::HuntingAndPecking,
                },
                sync_max: sae.sync_max,
            },
            h2e: sae.h2e,
            anti_clogging_threshold: sae.anti_clogging_threshold,
            retrans_timeout: Duration::from_millis(sae.retrans_timeout_ms),
            auth_timeout: Duration::from_millis(sae.auth_timeout_ms),
        };

        let lifetime = i64::try_from(self.pmksa.lifetime_secs).context("PMKSA lifetime too large")?;
        settings.pmksa_lifetime = chrono::Duration::seconds(lifetime);
        settings.pmksa_capacity = self.pmksa.capacity;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.security.policy, SecurityPolicy::Wpa2Psk);
        assert_eq!(config.handshake.authenticator_retries, 3);
        assert_eq!(config.handshake.supplicant_retries, 6);
        assert_eq!(config.sae.groups, vec![19]);
        assert_eq!(config.pmksa.capacity, 32);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [security]
            policy = "wpa3-transition"
            ssid = "lab"
            passphrase = "secret passphrase"
            pmf = "required"

            [handshake]
            authenticator_retries = 2
            group_rekey_interval_secs = 0
            rekey_on_leave = true

            [sae]
            h2e = "enabled"
            anti_clogging_threshold = 1

            [pmksa]
            store_path = "/tmp/pmksa.json"

            [link]
            ap_mac = "02:aa:00:00:00:01"
            sta_mac = "02:aa:00:00:00:02"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.security.policy, SecurityPolicy::Wpa3Transition);
        assert_eq!(config.security.pmf, Pmf::Required);
        assert_eq!(config.sae.h2e, H2eMode::Enabled);
        assert_eq!(config.pmksa.store_path, Some(PathBuf::from("/tmp/pmksa.json")));
        assert_eq!(config.link.ap_mac, MacAddr([0x02, 0xaa, 0, 0, 0, 1]));

        let ap = config.role_settings(Role::Authenticator).unwrap();
        assert_eq!(ap.own, config.link.ap_mac);
        assert_eq!(ap.retry.max_retries, 2);
        assert_eq!(ap.group_rekey_interval, None);
        assert!(ap.rekey_on_leave);
        assert_eq!(ap.sae.anti_clogging_threshold, 1);

        let sta = config.role_settings(Role::Supplicant).unwrap();
        assert_eq!(sta.own, config.link.sta_mac);
        assert_eq!(sta.retry.max_retries, 6);
    }

    #[test]
    fn test_short_passphrase_is_refused() {
        let mut config = Config::default();
        config.security.passphrase = "short".to_string();
        assert!(config.role_settings(Role::Authenticator).is_err());
    }

    #[test]
    fn test_unknown_policy_fails_to_parse() {
        let parsed: Result<Config, _> = toml::from_str("[security]\npolicy = \"wep\"\n");
        assert!(parsed.is_err());
    }
}
