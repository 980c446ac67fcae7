use crate::error::{HarvestError, Result};
use crate::harvest::HarvestOptions;
use canopy_scanner::{Identity, ListingQuery, PoliteDelay, RetryPolicy, ScrollPolicy, WalkPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunables for every stage. Each field has a default, so a config file only
/// needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub workers: usize,
    pub report_every: u64,
    pub retry_schedule_secs: Vec<u64>,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub attempt_timeout_secs: u64,
    /// Wait for the detail container on rendered pages.
    pub ready_timeout_secs: u64,
    pub ready_selector: String,
    pub tab_timeout_secs: u64,
    pub scroll_settle_ms: u64,
    pub scroll_max_stuck: u32,
    pub scroll_max_scrolls: u32,
    pub base_url: String,
    /// Path of the root taxon page, relative to `base_url`.
    pub root_path: String,
    pub api_endpoint: String,
    pub taxon_id: String,
    /// Ids never treated as species (kingdom and class roots).
    pub excluded_ids: Vec<String>,
    pub locale: String,
    pub page_size: u32,
    pub preferred_place_id: Option<String>,
    pub seed: Option<u64>,
    pub headless: bool,
    pub identities: Vec<Identity>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            report_every: 20,
            retry_schedule_secs: vec![0, 5, 15],
            delay_min_ms: 1500,
            delay_max_ms: 3500,
            attempt_timeout_secs: 45,
            ready_timeout_secs: 30,
            ready_selector: "#TaxonDetail".to_string(),
            tab_timeout_secs: 15,
            scroll_settle_ms: 3500,
            scroll_max_stuck: 3,
            scroll_max_scrolls: 300,
            base_url: "https://www.inaturalist.org".to_string(),
            root_path: "/taxa/3-Aves".to_string(),
            api_endpoint: "https://api.inaturalist.org/v1/taxa".to_string(),
            taxon_id: "3".to_string(),
            excluded_ids: vec!["1".to_string(), "3".to_string()],
            locale: "fr".to_string(),
            page_size: 200,
            preferred_place_id: Some("1".to_string()),
            seed: None,
            headless: true,
            identities: Vec::new(),
        }
    }
}

impl HarvestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| HarvestError::Input {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| HarvestError::Input {
            path: path.to_path_buf(),
            reason: format!("invalid config: {}", e),
        })
    }

    pub fn root_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.root_path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(&self.retry_schedule_secs)
    }

    pub fn polite_delay(&self) -> PoliteDelay {
        PoliteDelay::new(
            Duration::from_millis(self.delay_min_ms),
            Duration::from_millis(self.delay_max_ms.max(self.delay_min_ms)),
        )
    }

    pub fn walk_policy(&self) -> WalkPolicy {
        WalkPolicy {
            tab_timeout: Duration::from_secs(self.tab_timeout_secs),
            navigation_retry: self.retry_policy(),
            ..WalkPolicy::default()
        }
    }

    pub fn scroll_policy(&self) -> ScrollPolicy {
        ScrollPolicy {
            settle: Duration::from_millis(self.scroll_settle_ms),
            max_stuck: self.scroll_max_stuck,
            max_scrolls: self.scroll_max_scrolls,
        }
    }

    pub fn listing_query(&self, parent_id: &str) -> ListingQuery {
        let mut query = ListingQuery::new(&self.api_endpoint, parent_id);
        query.page_size = self.page_size;
        query.locale = self.locale.clone();
        query.preferred_place_id = self.preferred_place_id.clone();
        query.site_url = self.base_url.clone();
        query
    }

    /// `rendered` selects browser fetching; otherwise detail pages are plain GETs.
    pub fn harvest_options(&self, rendered: bool) -> HarvestOptions {
        HarvestOptions {
            report_every: self.report_every,
            retry: self.retry_policy(),
            delay: self.polite_delay(),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            ready_selector: rendered.then(|| self.ready_selector.clone()),
            seed: self.seed,
            extract: true,
            identities: self.identities.clone(),
        }
    }
}
