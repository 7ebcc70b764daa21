//! Persistence-based alerting over each region's recent drift history.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use terra_core::{AlertLevel, DriftAlert, DriftSnapshot};

use crate::config::DriftConfig;

#[derive(Debug, Clone)]
pub struct AlertEngine {
    config: DriftConfig,
}

/// Consecutive entries from the front of `newest_first` whose |drift| exceeds `threshold`.
fn streak(newest_first: &[&DriftSnapshot], threshold: f64) -> usize {
    newest_first
        .iter()
        .take_while(|s| s.drift_pct.abs() > threshold)
        .count()
}

impl AlertEngine {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    /// The lookback slice for one region, newest first.
    fn recent<'a>(
        &self,
        history: &'a [DriftSnapshot],
        now: DateTime<Utc>,
    ) -> Vec<&'a DriftSnapshot> {
        let since = now - Duration::days(self.config.lookback_days);
        let mut recent: Vec<&DriftSnapshot> = history
            .iter()
            .filter(|s| s.recorded_at >= since && s.recorded_at <= now)
            .collect();
        recent.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        recent.truncate(self.config.lookback_entries);
        recent
    }

    pub fn evaluate(
        &self,
        region: &str,
        history: &[DriftSnapshot],
        now: DateTime<Utc>,
    ) -> Option<DriftAlert> {
        let recent = self.recent(history, now);
        let newest = *recent.first()?;

        let critical = streak(&recent, self.config.critical_threshold_pct);
        let (level, periods) = if critical >= self.config.critical_periods {
            (AlertLevel::Critical, critical)
        } else {
            let warning = streak(&recent, self.config.warning_threshold_pct);
            if warning < self.config.warning_periods {
                return None;
            }
            (AlertLevel::Warning, warning)
        };

        let streak_slice = &recent[..periods];
        let smoothed = streak_slice.iter().map(|s| s.drift_pct).sum::<f64>() / periods as f64;
        let first_detected = streak_slice
            .last()
            .map(|s| s.recorded_at)
            .unwrap_or(newest.recorded_at);
        let direction = if newest.drift_pct >= 0.0 { "above" } else { "below" };
        let recommendation = match level {
            AlertLevel::Critical => format!(
                "Live prices in {region} have run {:.1}% {direction} the {} benchmark for {periods} consecutive periods; recalibrate the tier benchmark",
                smoothed.abs(),
                newest.tier
            ),
            _ => format!(
                "Live prices in {region} have stayed {:.1}% {direction} the {} benchmark for {periods} consecutive periods; review at the next recalibration",
                smoothed.abs(),
                newest.tier
            ),
        };

        Some(DriftAlert {
            region: region.to_string(),
            tier: newest.tier,
            current_drift_pct: newest.drift_pct,
            consecutive_periods: periods,
            level,
            first_detected,
            smoothed_drift_pct: smoothed,
            recommendation,
        })
    }

    /// CRITICAL first, then by descending |current drift|, then by region name.
    pub fn scan(
        &self,
        histories: &BTreeMap<String, Vec<DriftSnapshot>>,
        now: DateTime<Utc>,
    ) -> Vec<DriftAlert> {
        let mut alerts: Vec<DriftAlert> = histories
            .iter()
            .filter_map(|(region, history)| self.evaluate(region, history, now))
            .collect();
        alerts.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then_with(|| {
                    b.current_drift_pct
                        .abs()
                        .partial_cmp(&a.current_drift_pct.abs())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.region.cmp(&b.region))
        });
        alerts
    }
}
