//! Engine configuration: defaults for replication parameters and the
//! ranges of the minor and layer id pools.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LayerError, LayerResult};
use crate::numberpool::NumberRange;

/// Peer slots used when neither resource nor resource definition configures any.
pub const DEFAULT_PEER_SLOTS: u16 = 7;
/// Activity-log stripes used when the resource definition configures none.
pub const DEFAULT_AL_STRIPES: u32 = 1;
/// Activity-log stripe size in KiB used when the resource definition configures none.
pub const DEFAULT_AL_STRIPE_SIZE_KIB: u64 = 32;

/// Engine-wide defaults and number ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Peer slots when no property sets them.
    pub default_peer_slots: u16,
    /// Activity log stripes when no property sets them.
    pub default_al_stripes: u32,
    /// Activity log stripe size in KiB when no property sets it.
    pub default_al_stripe_size_kib: u64,
    /// Range of the device minor pool.
    pub minor_range: NumberRange,
    /// Range of the layer resource id pool.
    pub layer_id_range: NumberRange,
    /// Length of generated peer secrets.
    pub secret_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_peer_slots: DEFAULT_PEER_SLOTS,
            default_al_stripes: DEFAULT_AL_STRIPES,
            default_al_stripe_size_kib: DEFAULT_AL_STRIPE_SIZE_KIB,
            minor_range: NumberRange::new(1000, 49999),
            layer_id_range: NumberRange::new(0, 65535),
            secret_length: 20,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> LayerResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| LayerError::Config {
            reason: format!("{}: {}", path.display(), e),
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| LayerError::Config {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| LayerError::Config {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(LayerError::Config {
                    reason: format!("Unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects empty pool ranges and zero-valued minimums.
    pub fn validate(&self) -> LayerResult<()> {
        if self.minor_range.is_empty() {
            return Err(LayerError::Config {
                reason: "minor_range is empty".to_string(),
            });
        }
        if self.layer_id_range.is_empty() {
            return Err(LayerError::Config {
                reason: "layer_id_range is empty".to_string(),
            });
        }
        if self.default_peer_slots == 0 {
            return Err(LayerError::Config {
                reason: "default_peer_slots must be at least 1".to_string(),
            });
        }
        if self.secret_length == 0 {
            return Err(LayerError::Config {
                reason: "secret_length must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
