use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use terra_adapters::{source_for_config, ListingSource, SourceConfig};
use terra_storage::{FetcherConfig, RateLimitedFetcher};

/// Parsed `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut ids = std::collections::BTreeSet::new();
        for source in &registry.sources {
            if !ids.insert(source.source_id.as_str()) {
                anyhow::bail!("source `{}` is declared twice", source.source_id);
            }
        }
        Ok(registry)
    }

    /// Enabled sources in fallback order: ascending priority, ties by id.
    pub fn enabled_by_priority(&self) -> Vec<&SourceConfig> {
        let mut enabled: Vec<&SourceConfig> = self.sources.iter().filter(|s| s.enabled).collect();
        enabled.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        enabled
    }
}

/// One source wired up with its own fetcher and cache TTL.
pub struct SourceSlot {
    pub source: Box<dyn ListingSource>,
    pub http: RateLimitedFetcher,
    pub cache_ttl: chrono::Duration,
}

impl SourceSlot {
    pub fn new(source: Box<dyn ListingSource>, http: RateLimitedFetcher, cache_ttl: chrono::Duration) -> Self {
        Self {
            source,
            http,
            cache_ttl,
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }
}

pub fn build_slots(registry: &SourceRegistry, fetcher: &FetcherConfig) -> Result<Vec<SourceSlot>> {
    registry
        .enabled_by_priority()
        .into_iter()
        .map(|config| {
            let source = source_for_config(config)
                .with_context(|| format!("configuring source {}", config.source_id))?;
            let http = RateLimitedFetcher::new(config.source_id.clone(), fetcher.clone())?;
            Ok(SourceSlot::new(
                source,
                http,
                chrono::Duration::hours(config.cache_ttl_hours),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: ninetynine
    display_name: 99.co
    enabled: true
    priority: 2
    kind: next_data
    search_url: "https://www.99.co/id/jual/tanah/{region}?hlmn={page}"
    listings_pointer: /props/pageProps/searchResult/listings
  - source_id: rumah123
    display_name: Rumah123
    enabled: true
    priority: 2
    kind: json_ld
    search_url: "https://www.rumah123.com/jual/{region}/tanah/?page={page}"
  - source_id: olx
    display_name: OLX
    enabled: false
    priority: 0
    kind: json_ld
    search_url: "https://www.olx.co.id/{region}/tanah?page={page}"
  - source_id: lamudi
    display_name: Lamudi
    enabled: true
    priority: 1
    kind: html_cards
    search_url: "https://www.lamudi.co.id/tanah/buy/?q={query}&page={page}"
    cache_ttl_hours: 72
    selectors:
      card: div.ListingCell-AllInfo
      price: .PriceSection
"#;

    #[test]
    fn enabled_sources_sort_by_priority_then_id() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let order: Vec<_> = registry
            .enabled_by_priority()
            .into_iter()
            .map(|s| s.source_id.as_str())
            .collect();
        assert_eq!(order, vec!["lamudi", "ninetynine", "rumah123"]);
    }

    #[test]
    fn slots_carry_ttl_and_source_ids() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let slots = build_slots(&registry, &FetcherConfig::default()).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].source_id(), "lamudi");
        assert_eq!(slots[0].cache_ttl, chrono::Duration::hours(72));
        assert_eq!(slots[1].cache_ttl, chrono::Duration::hours(168));
    }

    #[test]
    fn shipped_registry_builds_every_source() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(&root.join("sources.yaml")).unwrap();
        let slots = build_slots(&registry, &FetcherConfig::default()).unwrap();
        let ids: Vec<_> = slots.iter().map(SourceSlot::source_id).collect();
        assert_eq!(ids, vec!["lamudi", "rumah123", "ninetynine"]);
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let doubled = format!("{REGISTRY}\n  - source_id: lamudi\n    display_name: Again\n    enabled: true\n    priority: 9\n    kind: json_ld\n    search_url: x\n");
        assert!(SourceRegistry::from_yaml(&doubled).is_err());
    }
}
