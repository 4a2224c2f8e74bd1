use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::KernelError, ids::Credential};

/// Version tag written into every compiled batch.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default upper bound for `units` on a single capsule.
pub const DEFAULT_MAX_UNITS: u64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Application tag recorded in compiled batches.
    pub app: String,
    /// Ledger network name, informational only.
    pub network: String,
    /// Credential given to capsules created at top level.
    pub owner: Credential,
    /// Start publishing as soon as a batch closes, when a tokio runtime is present.
    pub auto_publish: bool,
    pub max_units: u64,
    pub protocol: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            app: String::new(),
            network: "mock".into(),
            owner: Credential::address("default-owner"),
            auto_publish: true,
            max_units: DEFAULT_MAX_UNITS,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `CAPSULE_APP`, `CAPSULE_NETWORK`, `CAPSULE_OWNER`
    /// and `CAPSULE_AUTO_PUBLISH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(app) = std::env::var("CAPSULE_APP") {
            config.app = app;
        }
        if let Ok(network) = std::env::var("CAPSULE_NETWORK") {
            config.network = network;
        }
        if let Ok(owner) = std::env::var("CAPSULE_OWNER") {
            config.owner = Credential::Address(owner);
        }
        if let Ok(flag) = std::env::var("CAPSULE_AUTO_PUBLISH") {
            config.auto_publish = !matches!(flag.trim(), "0" | "false" | "no" | "off");
        }
        config
    }

    /// Load from a JSON file; absent keys keep their defaults.
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Store(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| KernelError::Encoding(format!("parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsules.json");
        std::fs::write(
            &path,
            r#"{ "app": "shop", "owner": { "kind": "address", "value": "alice" } }"#,
        )
        .unwrap();
        let config = KernelConfig::from_json_path(&path).unwrap();
        assert_eq!(config.app, "shop");
        assert_eq!(config.owner, Credential::address("alice"));
        assert_eq!(config.max_units, DEFAULT_MAX_UNITS);
        assert!(config.auto_publish);
    }

    #[test]
    fn malformed_json_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            KernelConfig::from_json_path(&path),
            Err(KernelError::Encoding(_))
        ));
    }
}
