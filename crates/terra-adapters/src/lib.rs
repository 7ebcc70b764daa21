//! Listing source contracts + the concrete land-listing scrapers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use terra_core::Listing;
use terra_storage::{FetchError, RateLimitedFetcher};
use thiserror::Error;
use tracing::{debug, warn};

pub mod html_cards;
pub mod json_ld;
pub mod next_data;
pub mod parse;

pub use html_cards::{CardSelectors, HtmlCardSource};
pub use json_ld::JsonLdSource;
pub use next_data::{NextDataFields, NextDataSource};

pub const CRATE_NAME: &str = "terra-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HtmlCards,
    JsonLd,
    NextData,
}

fn default_max_pages() -> u32 {
    1
}

fn default_cache_ttl_hours() -> i64 {
    168
}

fn default_category() -> String {
    "land".to_string()
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Lower runs first. Ties are broken by `source_id`.
    pub priority: u32,
    pub kind: SourceKind,
    /// Accepts `{region}` (slug), `{query}` (form-encoded) and `{page}` placeholders.
    pub search_url: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub selectors: Option<CardSelectors>,
    #[serde(default)]
    pub listings_pointer: Option<String>,
    #[serde(default)]
    pub fields: Option<NextDataFields>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn max_pages(&self) -> u32 {
        1
    }

    fn search_url(&self, region: &str, page: u32) -> String;

    /// Parses one result page. Individual unreadable ads are skipped; only a
    /// page-level problem is an error.
    fn parse_listings(&self, body: &str, page_url: &str) -> Result<Vec<Listing>, AdapterError>;

    async fn scrape(
        &self,
        http: &RateLimitedFetcher,
        region: &str,
        max_listings: usize,
    ) -> Result<Vec<Listing>, AdapterError> {
        let mut listings = Vec::new();
        for page in 1..=self.max_pages().max(1) {
            let url = self.search_url(region, page);
            let fetched = match http.fetch(&url).await {
                Ok(fetched) => fetched,
                Err(err) if page > 1 => {
                    warn!(source_id = self.source_id(), page, error = %err, "stopping pagination");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            let parsed = self.parse_listings(&fetched.body, &fetched.final_url)?;
            debug!(source_id = self.source_id(), page, parsed = parsed.len(), "parsed result page");
            if parsed.is_empty() {
                break;
            }
            listings.extend(parsed);
            if listings.len() >= max_listings {
                break;
            }
        }
        listings.truncate(max_listings);
        Ok(listings)
    }
}

/// Fills a `search_url` template for one region and page.
pub fn render_search_url(template: &str, region: &str, page: u32) -> String {
    let slug = terra_storage::normalize_key(region);
    let query = url::form_urlencoded::byte_serialize(region.trim().as_bytes()).collect::<String>();
    template
        .replace("{region}", &slug)
        .replace("{query}", &query)
        .replace("{page}", &page.to_string())
}

pub fn source_for_config(config: &SourceConfig) -> Result<Box<dyn ListingSource>, AdapterError> {
    match config.kind {
        SourceKind::HtmlCards => {
            let selectors = config.selectors.clone().ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {} is html_cards but has no selectors",
                    config.source_id
                ))
            })?;
            Ok(Box::new(HtmlCardSource::new(
                &config.source_id,
                &config.search_url,
                config.max_pages,
                &config.category,
                selectors,
            )?))
        }
        SourceKind::JsonLd => Ok(Box::new(JsonLdSource::new(
            &config.source_id,
            &config.search_url,
            config.max_pages,
            &config.category,
        ))),
        SourceKind::NextData => {
            let pointer = config.listings_pointer.clone().ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {} is next_data but has no listings_pointer",
                    config.source_id
                ))
            })?;
            Ok(Box::new(NextDataSource::new(
                &config.source_id,
                &config.search_url,
                config.max_pages,
                &config.category,
                pointer,
                config.fields.clone().unwrap_or_default(),
            )))
        }
    }
}
