// =============================================================================
// Execution Configuration — hot-reloadable tunables with atomic save
// =============================================================================
//
// Every tunable the execution core needs at runtime lives here so it can be
// reconfigured without a restart. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. Every field carries
// `#[serde(default = "...")]` so that adding a field never breaks loading an
// older config file.
//
// Credentials (API keys, secrets, nonce seed material) are *not* part of this
// struct — they are parsed separately from a line-oriented text file, see
// `crate::credentials`.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_max_position_ratio() -> f64 {
    0.8
}

fn default_min_collateral_buffer() -> f64 {
    0.1
}

fn default_max_venue_concentration() -> f64 {
    0.6
}

fn default_max_order_size_ratio() -> f64 {
    0.2
}

fn default_coi_limit() -> u64 {
    u32::MAX as u64
}

fn default_tick_size_secs() -> f64 {
    1.0
}

fn default_book_freshness_horizon_secs() -> f64 {
    3.0
}

fn default_depth_reconnect_backoff_secs() -> f64 {
    1.0
}

fn default_diagnostic_report_path() -> String {
    "diagnostic_report.json".to_string()
}

/// Top-level configuration for the execution core.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    // --- Risk defaults (§4.I) ------------------------------------------------
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: f64,

    #[serde(default = "default_min_collateral_buffer")]
    pub min_collateral_buffer: f64,

    #[serde(default = "default_max_venue_concentration")]
    pub max_venue_concentration: f64,

    #[serde(default = "default_max_order_size_ratio")]
    pub max_order_size_ratio: f64,

    // --- Client-order-id allocator (§4.B) ------------------------------------
    #[serde(default = "default_coi_limit")]
    pub default_coi_limit: u64,

    #[serde(default)]
    pub coi_limit_overrides: HashMap<String, u64>,

    // --- Rate limiter (§4.A) --------------------------------------------------
    #[serde(default)]
    pub rate_limit_capacity_per_minute: HashMap<String, u32>,

    // --- Clock / tick dispatcher (§4.L) ---------------------------------------
    #[serde(default = "default_tick_size_secs")]
    pub tick_size_secs: f64,

    // --- Connector / book (§4.F) -----------------------------------------------
    #[serde(default = "default_book_freshness_horizon_secs")]
    pub book_freshness_horizon_secs: f64,

    #[serde(default = "default_depth_reconnect_backoff_secs")]
    pub depth_reconnect_backoff_secs: f64,

    // --- Diagnostic harness (§4.M) ---------------------------------------------
    #[serde(default = "default_diagnostic_report_path")]
    pub diagnostic_report_path: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_position_ratio: default_max_position_ratio(),
            min_collateral_buffer: default_min_collateral_buffer(),
            max_venue_concentration: default_max_venue_concentration(),
            max_order_size_ratio: default_max_order_size_ratio(),
            default_coi_limit: default_coi_limit(),
            coi_limit_overrides: HashMap::new(),
            rate_limit_capacity_per_minute: HashMap::new(),
            tick_size_secs: default_tick_size_secs(),
            book_freshness_horizon_secs: default_book_freshness_horizon_secs(),
            depth_reconnect_backoff_secs: default_depth_reconnect_backoff_secs(),
            diagnostic_report_path: default_diagnostic_report_path(),
        }
    }
}

impl ExecutionConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read execution config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse execution config from {}", path.display()))?;

        info!(
            path = %path.display(),
            max_position_ratio = config.max_position_ratio,
            tick_size_secs = config.tick_size_secs,
            "execution config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise execution config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "execution config saved (atomic)");
        Ok(())
    }

    /// COI wraparound limit for `venue`, falling back to the global default.
    pub fn coi_limit(&self, venue: &str) -> u64 {
        self.coi_limit_overrides
            .get(venue)
            .copied()
            .unwrap_or(self.default_coi_limit)
    }

    /// Rate-limit bucket capacity for `endpoint_class`, falling back to a
    /// single default bucket when the config has no entry for it.
    pub fn rate_limit_capacity(&self, endpoint_class: &str) -> u32 {
        self.rate_limit_capacity_per_minute
            .get(endpoint_class)
            .copied()
            .unwrap_or_else(|| {
                self.rate_limit_capacity_per_minute
                    .get("default")
                    .copied()
                    .unwrap_or(1200)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ExecutionConfig::default();
        assert!((cfg.max_position_ratio - 0.8).abs() < f64::EPSILON);
        assert!((cfg.min_collateral_buffer - 0.1).abs() < f64::EPSILON);
        assert!((cfg.max_venue_concentration - 0.6).abs() < f64::EPSILON);
        assert!((cfg.max_order_size_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.default_coi_limit, u32::MAX as u64);
        assert!((cfg.tick_size_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.diagnostic_report_path, "diagnostic_report.json");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ExecutionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.default_coi_limit, u32::MAX as u64);
        assert!((cfg.book_freshness_horizon_secs - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "max_position_ratio": 0.5 }"#;
        let cfg: ExecutionConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.max_position_ratio - 0.5).abs() < f64::EPSILON);
        assert!((cfg.min_collateral_buffer - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = ExecutionConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ExecutionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.default_coi_limit, cfg2.default_coi_limit);
        assert!((cfg.max_position_ratio - cfg2.max_position_ratio).abs() < f64::EPSILON);
    }

    #[test]
    fn per_venue_coi_override_wins_over_default() {
        let mut cfg = ExecutionConfig::default();
        cfg.coi_limit_overrides.insert("lighter".to_string(), (1u64 << 48) - 1);
        assert_eq!(cfg.coi_limit("lighter"), (1u64 << 48) - 1);
        assert_eq!(cfg.coi_limit("backpack"), u32::MAX as u64);
    }

    #[test]
    fn save_then_load_roundtrips_via_atomic_rename() {
        let dir = std::env::temp_dir().join(format!("execcfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = ExecutionConfig::default();
        cfg.tick_size_secs = 2.5;
        cfg.save(&path).unwrap();

        let loaded = ExecutionConfig::load(&path).unwrap();
        assert!((loaded.tick_size_secs - 2.5).abs() < f64::EPSILON);

        std::fs::remove_dir_all(&dir).ok();
    }
}
