//! Region catalog (`config/regions.yaml`) and region → tier classification.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use terra_core::Tier;
use terra_storage::normalize_key;
use tracing::debug;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub name: String,
    pub tier: Tier,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionCatalog {
    pub regions: Vec<RegionEntry>,
}

impl RegionCatalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        catalog.validate().map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.regions {
            let key = normalize_key(&entry.name);
            if key.is_empty() {
                return Err("region with an empty name".to_string());
            }
            if !seen.insert(key) {
                return Err(format!("region `{}` is listed twice", entry.name));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Alias,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub region: String,
    pub tier: Tier,
    pub matched: MatchKind,
}

#[derive(Debug, Clone)]
struct ClassifierKey {
    key: String,
    region: String,
    tier: Tier,
    alias: bool,
}

/// Matches free-form region names against the catalog: normalized exact
/// match first, then aliases, then Jaro-Winkler similarity above a threshold.
#[derive(Debug, Clone)]
pub struct RegionClassifier {
    keys: Vec<ClassifierKey>,
    fuzzy_threshold: f64,
}

impl RegionClassifier {
    pub fn new(catalog: &RegionCatalog, fuzzy_threshold: f64) -> Self {
        let mut keys = Vec::new();
        for entry in &catalog.regions {
            keys.push(ClassifierKey {
                key: normalize_key(&entry.name),
                region: entry.name.clone(),
                tier: entry.tier,
                alias: false,
            });
            for alias in &entry.aliases {
                keys.push(ClassifierKey {
                    key: normalize_key(alias),
                    region: entry.name.clone(),
                    tier: entry.tier,
                    alias: true,
                });
            }
        }
        Self {
            keys,
            fuzzy_threshold,
        }
    }

    pub fn classify(&self, region: &str) -> Option<Classification> {
        let wanted = normalize_key(region);
        if wanted.is_empty() {
            return None;
        }
        if let Some(hit) = self.keys.iter().find(|k| k.key == wanted) {
            return Some(Classification {
                region: hit.region.clone(),
                tier: hit.tier,
                matched: if hit.alias { MatchKind::Alias } else { MatchKind::Exact },
            });
        }

        let best = self
            .keys
            .iter()
            .map(|k| (jaro_winkler(&k.key, &wanted), k))
            .max_by(|a, b| a.0.total_cmp(&b.0))?;
        if best.0 >= self.fuzzy_threshold {
            debug!(input = region, matched = %best.1.region, score = best.0, "fuzzy region match");
            Some(Classification {
                region: best.1.region.clone(),
                tier: best.1.tier,
                matched: MatchKind::Fuzzy,
            })
        } else {
            None
        }
    }

    /// Exact or alias matches only. History is keyed by the resolved name, so
    /// a near miss must not land in another region's history.
    pub fn resolve(&self, region: &str) -> Option<Classification> {
        self.classify(region).filter(|c| c.matched != MatchKind::Fuzzy)
    }

    pub fn tier_of(&self, region: &str) -> Option<Tier> {
        self.classify(region).map(|c| c.tier)
    }
}
