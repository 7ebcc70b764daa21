use chrono::{DateTime, Utc};
use terra_core::{AlertLevel, DriftSnapshot};
use tracing::debug;

use crate::benchmarks::BenchmarkTable;
use crate::config::DriftConfig;
use crate::regions::RegionClassifier;

/// Percentage deviation of `live` from `benchmark`.
pub fn drift_pct(live: f64, benchmark: f64) -> f64 {
    (live - benchmark) / benchmark * 100.0
}

/// Advisory single-snapshot band. Alerts themselves are persistence-based.
pub fn classify_drift(drift_pct: f64, config: &DriftConfig) -> AlertLevel {
    let magnitude = drift_pct.abs();
    if magnitude > config.critical_threshold_pct {
        AlertLevel::Critical
    } else if magnitude > config.warning_threshold_pct {
        AlertLevel::Warning
    } else {
        AlertLevel::None
    }
}

pub struct DriftRecorder<'a> {
    classifier: &'a RegionClassifier,
    benchmarks: &'a BenchmarkTable,
    config: &'a DriftConfig,
}

impl<'a> DriftRecorder<'a> {
    pub fn new(
        classifier: &'a RegionClassifier,
        benchmarks: &'a BenchmarkTable,
        config: &'a DriftConfig,
    ) -> Self {
        Self {
            classifier,
            benchmarks,
            config,
        }
    }

    /// `None` when the region is not catalogued by name or alias, the tier has
    /// no usable benchmark, or the live price itself is unusable.
    pub fn record(
        &self,
        region: &str,
        live_price: f64,
        data_source: &str,
        confidence: f64,
        recorded_at: DateTime<Utc>,
    ) -> Option<DriftSnapshot> {
        let Some(classification) = self.classifier.resolve(region) else {
            debug!(region, "region not catalogued; skipping drift snapshot");
            return None;
        };
        let Some(benchmark) = self.benchmarks.get(classification.tier) else {
            debug!(region, tier = %classification.tier, "no benchmark for tier");
            return None;
        };
        if !(live_price > 0.0 && live_price.is_finite()) {
            debug!(region, live_price, "unusable live price");
            return None;
        }
        let drift = drift_pct(live_price, benchmark);
        Some(DriftSnapshot {
            recorded_at,
            region: classification.region,
            tier: classification.tier,
            benchmark_price: benchmark,
            live_price,
            drift_pct: drift,
            data_source: data_source.to_string(),
            confidence,
            alert_level: classify_drift(drift, self.config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::{RegionCatalog, RegionEntry};
    use std::collections::BTreeMap;
    use terra_core::Tier;

    fn fixtures() -> (RegionClassifier, BenchmarkTable) {
        let catalog = RegionCatalog {
            regions: vec![
                RegionEntry {
                    name: "Jakarta Selatan".into(),
                    tier: Tier::Metro,
                    aliases: vec![],
                },
                RegionEntry {
                    name: "Sleman".into(),
                    tier: Tier::Secondary,
                    aliases: vec![],
                },
            ],
        };
        let mut tiers = BTreeMap::new();
        tiers.insert(Tier::Metro, 8_000_000.0);
        tiers.insert(Tier::Secondary, 0.0);
        let table = BenchmarkTable {
            currency: "IDR".into(),
            updated_at: None,
            tiers,
        };
        (RegionClassifier::new(&catalog, 0.92), table)
    }

    #[test]
    fn metro_drift_of_37_5_percent_is_critical() {
        let (classifier, table) = fixtures();
        let config = DriftConfig::default();
        let recorder = DriftRecorder::new(&classifier, &table, &config);
        let snapshot = recorder
            .record("Jakarta Selatan", 11_000_000.0, "source_live[0]", 0.85, Utc::now())
            .unwrap();
        assert_eq!(snapshot.drift_pct, 37.5);
        assert_eq!(snapshot.alert_level, AlertLevel::Critical);
        assert_eq!(snapshot.tier, Tier::Metro);
        assert_eq!(snapshot.benchmark_price, 8_000_000.0);
    }

    #[test]
    fn unknown_region_or_missing_benchmark_records_nothing() {
        let (classifier, table) = fixtures();
        let config = DriftConfig::default();
        let recorder = DriftRecorder::new(&classifier, &table, &config);
        assert!(recorder.record("Atlantis", 1.0, "source_live[0]", 0.85, Utc::now()).is_none());
        assert!(recorder.record("Sleman", 1.0, "source_live[0]", 0.85, Utc::now()).is_none());
    }

    #[test]
    fn near_miss_region_is_not_filed_under_its_neighbour() {
        let catalog = RegionCatalog {
            regions: vec![RegionEntry {
                name: "Jakarta Barat".into(),
                tier: Tier::Metro,
                aliases: vec![],
            }],
        };
        let classifier = RegionClassifier::new(&catalog, 0.92);
        let (_, table) = fixtures();
        let config = DriftConfig::default();
        let recorder = DriftRecorder::new(&classifier, &table, &config);

        assert_eq!(classifier.tier_of("Jakarta Utara"), Some(Tier::Metro));
        assert!(recorder
            .record("Jakarta Utara", 11_000_000.0, "source_live[0]", 0.85, Utc::now())
            .is_none());
        let own = recorder
            .record("jakarta barat", 11_000_000.0, "source_live[0]", 0.85, Utc::now())
            .unwrap();
        assert_eq!(own.region, "Jakarta Barat");
    }

    #[test]
    fn single_snapshot_bands() {
        let config = DriftConfig::default();
        assert_eq!(classify_drift(-20.5, &config), AlertLevel::Critical);
        assert_eq!(classify_drift(20.0, &config), AlertLevel::Warning);
        assert_eq!(classify_drift(12.5, &config), AlertLevel::Warning);
        assert_eq!(classify_drift(10.0, &config), AlertLevel::None);
    }
}
