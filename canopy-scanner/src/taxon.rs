use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// First-tier node of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Second-tier node; keeps the name of the order it was found under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub id: String,
    pub name: String,
    pub order: String,
    pub url: String,
}

/// A leaf of the hierarchy, i.e. one species to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(alias = "common_name", alias = "nom")]
    pub name: String,
    #[serde(default, alias = "nom_scientifique")]
    pub scientific_name: String,
    #[serde(default)]
    pub parent_family: String,
    #[serde(default)]
    pub parent_order: String,
    #[serde(alias = "url")]
    pub detail_url: String,
    /// Backup image reported by the listing API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_image_url: Option<String>,
}

/// Raw child link found on a rendered page, before it is typed into an
/// order, family or species.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonLink {
    pub id: String,
    pub name: String,
    pub href: String,
}

fn taxa_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/taxa/(\d+)").expect("static regex"))
}

/// Numeric taxon id embedded in a `/taxa/<id>-<slug>` path.
pub fn taxon_id_from_href(href: &str) -> Option<String> {
    taxa_id_regex()
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Join an href onto the site base. Absolute hrefs pass through.
pub fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    url::Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{}{}", base_url.trim_end_matches('/'), href))
}
