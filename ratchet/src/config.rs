//! Tunable bounds for a session (§6), loadable from defaults, a TOML file,
//! or constructed programmatically.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RatchetConfig {
    pub max_ratchet_steps: usize,
    pub max_skipped_keys: usize,
    pub skipped_key_ttl_secs: u64,
    pub max_message_keys_per_step: usize,
    pub exportable_keys: bool,
    pub debug: bool,
}

impl RatchetConfig {
    pub fn skipped_key_ttl(&self) -> Duration {
        Duration::from_secs(self.skipped_key_ttl_secs)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

impl Default for RatchetConfig {
    fn default() -> Self {
        RatchetConfig {
            max_ratchet_steps: 1000,
            max_skipped_keys: 10_000,
            skipped_key_ttl_secs: 7 * 24 * 3600,
            max_message_keys_per_step: 1000,
            exportable_keys: false,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_interface_table() {
        let cfg = RatchetConfig::default();
        assert_eq!(cfg.max_ratchet_steps, 1000);
        assert_eq!(cfg.max_skipped_keys, 10_000);
        assert_eq!(cfg.skipped_key_ttl(), Duration::from_secs(604_800));
        assert_eq!(cfg.max_message_keys_per_step, 1000);
        assert!(!cfg.exportable_keys);
        assert!(!cfg.debug);
    }

    #[test]
    fn toml_roundtrip_with_partial_overrides() {
        let toml_str = "max_ratchet_steps = 5\ndebug = true\n";
        let cfg = RatchetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.max_ratchet_steps, 5);
        assert!(cfg.debug);
        assert_eq!(cfg.max_skipped_keys, 10_000); // unspecified fields keep defaults
    }
}
