use std::path::Path;

use serde::{Deserialize, Serialize};
use terra_core::Tier;

use crate::ConfigError;

/// Alert and recalibration thresholds from `config/drift.yaml`.
///
/// The 10%/20% bands and the 4/2 period streaks are hand-tuned heuristics,
/// kept here as defaults so operators can retune them without a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
    pub warning_periods: usize,
    pub critical_periods: usize,
    pub lookback_entries: usize,
    pub lookback_days: i64,
    pub retention_days: i64,
    pub smoothing_days: i64,
    pub review_window_days: i64,
    pub recalibration_threshold_pct: f64,
    pub high_urgency_threshold_pct: f64,
    /// Tier used for benchmark fallback when a region is not in the catalog.
    pub fallback_tier: Tier,
    pub fuzzy_match_threshold: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: 10.0,
            critical_threshold_pct: 20.0,
            warning_periods: 4,
            critical_periods: 2,
            lookback_entries: 8,
            lookback_days: 60,
            retention_days: 180,
            smoothing_days: 30,
            review_window_days: 90,
            recalibration_threshold_pct: 10.0,
            high_urgency_threshold_pct: 20.0,
            fallback_tier: Tier::Emerging,
            fuzzy_match_threshold: 0.92,
        }
    }
}

impl DriftConfig {
    /// A missing file means "all defaults"; an unreadable or invalid one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.warning_threshold_pct > 0.0 && self.critical_threshold_pct > self.warning_threshold_pct) {
            return Err(format!(
                "thresholds must satisfy 0 < warning ({}) < critical ({})",
                self.warning_threshold_pct, self.critical_threshold_pct
            ));
        }
        if self.warning_periods == 0 || self.critical_periods == 0 || self.lookback_entries == 0 {
            return Err("period counts and lookback_entries must be at least 1".to_string());
        }
        if self.lookback_days <= 0
            || self.retention_days <= 0
            || self.smoothing_days <= 0
            || self.review_window_days <= 0
        {
            return Err("day windows must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.fuzzy_match_threshold) {
            return Err(format!(
                "fuzzy_match_threshold {} is outside 0..=1",
                self.fuzzy_match_threshold
            ));
        }
        Ok(())
    }
}
