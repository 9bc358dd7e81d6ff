// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Helios engine.  Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::SystemMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_min_spread_pct() -> f64 {
    0.01
}

fn default_min_uos_score() -> u8 {
    50
}

fn default_min_uos_auto_execute() -> u8 {
    75
}

fn default_detection_interval_secs() -> u64 {
    10
}

fn default_opportunity_ttl_minutes() -> i64 {
    30
}

fn default_max_concurrent_coins() -> usize {
    5
}

fn default_reserve_target_pct() -> f64 {
    20.0
}

fn default_delta_tolerance_pct() -> f64 {
    2.0
}

fn default_default_leverage() -> u32 {
    3
}

fn default_min_notional_usd() -> f64 {
    6.0
}

fn default_default_position_size_usd() -> f64 {
    100.0
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_secondary_poll_secs() -> u64 {
    60
}

fn default_spread_history_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_reservation_ttl_secs() -> i64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_target_funding_rate_min() -> f64 {
    0.005
}

fn default_max_hold_periods() -> u32 {
    72
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Helios engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current system mode: standard (trading) or discovery (detect only).
    #[serde(default)]
    pub mode: SystemMode,

    /// Whether detection cycles may hand opportunities to the executor
    /// without operator confirmation.
    #[serde(default = "default_false")]
    pub auto_execute: bool,

    // --- Detection -----------------------------------------------------------

    /// Minimum funding spread (percent) for a pair to become an opportunity.
    #[serde(default = "default_min_spread_pct")]
    pub min_spread_pct: f64,

    /// Minimum UOS score to keep an opportunity alive.
    #[serde(default = "default_min_uos_score")]
    pub min_uos_score: u8,

    /// Minimum UOS score for auto-execution.
    #[serde(default = "default_min_uos_auto_execute")]
    pub min_uos_auto_execute: u8,

    /// Periodic detection cycle interval, seconds.
    #[serde(default = "default_detection_interval_secs")]
    pub detection_interval_secs: u64,

    /// Opportunities expire this many minutes after detection unless
    /// refreshed by a newer spread.
    #[serde(default = "default_opportunity_ttl_minutes")]
    pub opportunity_ttl_minutes: i64,

    /// Only create opportunities whose exchanges both have credentials.
    #[serde(default = "default_true")]
    pub only_executable: bool,

    // --- Capital & positions -------------------------------------------------

    /// Maximum number of distinct symbols with live capital at once.
    #[serde(default = "default_max_concurrent_coins")]
    pub max_concurrent_coins: usize,

    /// Share of total capital kept in the reserve pool, percent.
    #[serde(default = "default_reserve_target_pct")]
    pub reserve_target_pct: f64,

    /// Net-delta tolerance for a hedged position, percent of notional.
    #[serde(default = "default_delta_tolerance_pct")]
    pub delta_tolerance_pct: f64,

    /// Whether the position manager actively rebalances drifted deltas.
    #[serde(default = "default_false")]
    pub enable_rebalancing: bool,

    /// Whether reconciliation adopts on-exchange orphans automatically.
    #[serde(default = "default_true")]
    pub auto_adopt_orphans: bool,

    /// Leverage used by the executor when the caller does not override it.
    #[serde(default = "default_default_leverage")]
    pub default_leverage: u32,

    /// Orders are sized up so notional never falls below this (common $5
    /// exchange floors, plus margin).
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: f64,

    /// Capital used when neither the caller nor the opportunity recommends
    /// a size.
    #[serde(default = "default_default_position_size_usd")]
    pub default_position_size_usd: f64,

    /// Default funding P&L floor per period, percent, below which a position
    /// exits after three collected periods.
    #[serde(default = "default_target_funding_rate_min")]
    pub target_funding_rate_min: f64,

    /// Funding periods after which a position is force-closed.
    #[serde(default = "default_max_hold_periods")]
    pub max_hold_periods: u32,

    // --- Loop cadences -------------------------------------------------------

    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_secondary_poll_secs")]
    pub secondary_poll_secs: u64,

    #[serde(default = "default_spread_history_secs")]
    pub spread_history_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Seconds a reserved allocation survives without confirmation.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: i64,

    /// Retry attempts for outbound adapter operations.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: SystemMode::Discovery,
            auto_execute: false,
            min_spread_pct: default_min_spread_pct(),
            min_uos_score: default_min_uos_score(),
            min_uos_auto_execute: default_min_uos_auto_execute(),
            detection_interval_secs: default_detection_interval_secs(),
            opportunity_ttl_minutes: default_opportunity_ttl_minutes(),
            only_executable: true,
            max_concurrent_coins: default_max_concurrent_coins(),
            reserve_target_pct: default_reserve_target_pct(),
            delta_tolerance_pct: default_delta_tolerance_pct(),
            enable_rebalancing: false,
            auto_adopt_orphans: true,
            default_leverage: default_default_leverage(),
            min_notional_usd: default_min_notional_usd(),
            default_position_size_usd: default_default_position_size_usd(),
            target_funding_rate_min: default_target_funding_rate_min(),
            max_hold_periods: default_max_hold_periods(),
            sync_interval_secs: default_sync_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            secondary_poll_secs: default_secondary_poll_secs(),
            spread_history_secs: default_spread_history_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            auto_execute = config.auto_execute,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mode, SystemMode::Discovery);
        assert!(!cfg.auto_execute);
        assert_eq!(cfg.min_uos_score, 50);
        assert_eq!(cfg.min_uos_auto_execute, 75);
        assert_eq!(cfg.max_concurrent_coins, 5);
        assert_eq!(cfg.opportunity_ttl_minutes, 30);
        assert_eq!(cfg.default_leverage, 3);
        assert!((cfg.min_notional_usd - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, SystemMode::Discovery);
        assert!(!cfg.auto_execute);
        assert_eq!(cfg.min_uos_auto_execute, 75);
        assert_eq!(cfg.sync_interval_secs, 30);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "standard", "auto_execute": true, "max_concurrent_coins": 3 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, SystemMode::Standard);
        assert!(cfg.auto_execute);
        assert_eq!(cfg.max_concurrent_coins, 3);
        assert_eq!(cfg.min_uos_score, 50);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.max_concurrent_coins, cfg2.max_concurrent_coins);
        assert_eq!(cfg.min_uos_auto_execute, cfg2.min_uos_auto_execute);
    }
}
