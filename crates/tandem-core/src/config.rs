//! Engine configuration
//!
//! Loaded from TOML, overridable from `TANDEM_*` environment variables.
//!
//! ```toml
//! [wal]
//! namespace = "tenant-a/wal"
//! layout = "per-record"
//!
//! [state]
//! namespace = "tenant-a/channels"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::errors::TandemError;

/// Environment override for `wal.namespace`
pub const ENV_WAL_NAMESPACE: &str = "TANDEM_WAL_NAMESPACE";
/// Environment override for `wal.layout`
pub const ENV_WAL_LAYOUT: &str = "TANDEM_WAL_LAYOUT";
/// Environment override for `state.namespace`
pub const ENV_STATE_NAMESPACE: &str = "TANDEM_STATE_NAMESPACE";

/// How the write-ahead log is laid out in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalLayout {
    /// Whole log as one document under the namespace key, rewritten on every
    /// write/clear. Only one engine may use the store.
    #[default]
    Document,
    /// One entry per log key under `{namespace}/`, written with
    /// compare-and-swap so several engines can share a store.
    PerRecord,
}

impl FromStr for WalLayout {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "per-record" => Ok(Self::PerRecord),
            other => Err(TandemError::invalid(format!("unknown WAL layout: {other}"))),
        }
    }
}

/// Write-ahead log settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Store key (document layout) or key prefix (per-record layout)
    pub namespace: String,
    /// Persistence layout
    pub layout: WalLayout,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            namespace: "tandem/wal".to_string(),
            layout: WalLayout::Document,
        }
    }
}

/// Channel state store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Key prefix under which each channel is persisted
    pub namespace: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            namespace: "tandem/channels".to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Write-ahead log settings
    pub wal: WalConfig,
    /// Channel state store settings
    pub state: StateConfig,
}

impl EngineConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, TandemError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TandemError::invalid(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, TandemError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TandemError::invalid(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `TANDEM_*` environment overrides
    pub fn merge_with_env(&mut self) -> Result<(), TandemError> {
        if let Ok(namespace) = std::env::var(ENV_WAL_NAMESPACE) {
            self.wal.namespace = namespace;
        }
        if let Ok(layout) = std::env::var(ENV_WAL_LAYOUT) {
            self.wal.layout = layout.parse()?;
        }
        if let Ok(namespace) = std::env::var(ENV_STATE_NAMESPACE) {
            self.state.namespace = namespace;
        }
        self.validate()
    }

    /// Validate the configuration
    ///
    /// Namespaces must be non-empty and disjoint: neither may be a prefix of
    /// the other, or per-record WAL listings would pick up channel records.
    pub fn validate(&self) -> Result<(), TandemError> {
        let wal = self.wal.namespace.as_str();
        let state = self.state.namespace.as_str();
        if wal.is_empty() || state.is_empty() {
            return Err(TandemError::invalid("namespaces cannot be empty"));
        }
        if wal.starts_with(state) || state.starts_with(wal) {
            return Err(TandemError::invalid(format!(
                "WAL namespace {wal} and state namespace {state} overlap"
            )));
        }
        Ok(())
    }
}
