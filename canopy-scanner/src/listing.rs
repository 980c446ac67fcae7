use crate::error::{Result, ScanError};
use crate::fetcher::{Fetcher, Target, Transport};
use crate::outcome::FetchResult;
use crate::taxon::Entity;
use serde::Deserialize;
use tracing::{debug, error, info};
use url::Url;

/// Parameters of the cursor-paginated taxa listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub endpoint: String,
    pub parent_id: String,
    pub rank: String,
    pub page_size: u32,
    pub locale: String,
    pub preferred_place_id: Option<String>,
    /// Site used to build each entity's detail page URL.
    pub site_url: String,
}

impl ListingQuery {
    pub fn new(endpoint: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            parent_id: parent_id.into(),
            rank: "species".to_string(),
            page_size: 200,
            locale: "fr".to_string(),
            preferred_place_id: Some("1".to_string()),
            site_url: "https://www.inaturalist.org".to_string(),
        }
    }

    /// URL of the page that follows `cursor` (the last id already seen).
    pub fn page_url(&self, cursor: u64) -> Result<String> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", self.endpoint, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("taxon_id", &self.parent_id)
                .append_pair("rank", &self.rank)
                .append_pair("per_page", &self.page_size.to_string())
                .append_pair("locale", &self.locale)
                .append_pair("is_active", "true")
                .append_pair("order", "asc")
                .append_pair("order_by", "id")
                .append_pair("id_above", &cursor.to_string());
            if let Some(ref place) = self.preferred_place_id {
                pairs.append_pair("preferred_place_id", place);
            }
        }
        Ok(url.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    results: Vec<ListedTaxon>,
}

#[derive(Debug, Deserialize)]
struct ListedTaxon {
    id: u64,
    name: String,
    #[serde(default)]
    preferred_common_name: Option<String>,
    #[serde(default)]
    default_photo: Option<ListedPhoto>,
}

#[derive(Debug, Deserialize)]
struct ListedPhoto {
    #[serde(default)]
    medium_url: Option<String>,
}

impl ListedTaxon {
    fn into_entity(self, site_url: &str) -> Entity {
        let common = self.preferred_common_name.unwrap_or_default();
        Entity {
            id: self.id.to_string(),
            name: if common.is_empty() {
                self.name.clone()
            } else {
                common
            },
            scientific_name: self.name,
            parent_family: String::new(),
            parent_order: String::new(),
            detail_url: format!("{}/taxa/{}", site_url.trim_end_matches('/'), self.id),
            api_image_url: self.default_photo.and_then(|p| p.medium_url),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub entities: Vec<Entity>,
    pub pages: u32,
    /// False when a page failed and the listing stopped early.
    pub exhausted: bool,
}

impl Listing {
    fn partial(entities: Vec<Entity>, pages: u32) -> Self {
        Self {
            entities,
            pages,
            exhausted: false,
        }
    }
}

/// Page through the listing until an empty page comes back. Nothing is
/// assumed about the total: the loop only ends on an empty page or a page
/// that could not be fetched or read, in which case the entities gathered so
/// far come back with `exhausted` unset.
pub async fn list_all<T: Transport>(fetcher: &mut Fetcher<T>, query: &ListingQuery) -> Result<Listing> {
    info!(
        "Listing {} under taxon {} ({} per page)",
        query.rank, query.parent_id, query.page_size
    );

    let mut entities: Vec<Entity> = Vec::new();
    let mut cursor = 0u64;
    let mut pages = 0u32;

    loop {
        let url = query.page_url(cursor)?;
        let report = fetcher.fetch(&Target::http(url)).await;

        let body = match report.result {
            FetchResult::Success { content, .. } => content,
            FetchResult::NotFound => {
                error!("Listing endpoint returned 404 at cursor {}", cursor);
                return Ok(Listing::partial(entities, pages));
            }
            FetchResult::Failed(last) => {
                error!(
                    "Listing page at cursor {} failed after {} attempts: {}",
                    cursor,
                    report.attempts,
                    last.label()
                );
                return Ok(Listing::partial(entities, pages));
            }
        };

        let page: ListingPage = match serde_json::from_str(&body) {
            Ok(page) => page,
            Err(e) => {
                error!("Listing page at cursor {} is not valid JSON: {}", cursor, e);
                return Ok(Listing::partial(entities, pages));
            }
        };
        if page.results.is_empty() {
            break;
        }
        pages += 1;

        let last_id = page.results.iter().map(|t| t.id).max().unwrap_or(cursor);
        if last_id <= cursor {
            // A cursor that does not advance would loop forever.
            error!("Listing cursor did not advance past {}", cursor);
            return Ok(Listing::partial(entities, pages));
        }
        cursor = last_id;

        entities.extend(page.results.into_iter().map(|t| t.into_entity(&query.site_url)));
        debug!("Indexed {} entities (cursor {})", entities.len(), cursor);
    }

    info!("Listing complete: {} entities in {} pages", entities.len(), pages);
    Ok(Listing {
        entities,
        pages,
        exhausted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_url_carries_cursor() {
        let query = ListingQuery::new("https://api.example.test/v1/taxa", "3");
        let url = query.page_url(4242).unwrap();
        assert!(url.starts_with("https://api.example.test/v1/taxa?"));
        assert!(url.contains("taxon_id=3"));
        assert!(url.contains("id_above=4242"));
        assert!(url.contains("per_page=200"));
        assert!(url.contains("rank=species"));
    }

    #[test]
    fn test_invalid_endpoint() {
        let query = ListingQuery::new("not a url", "3");
        assert!(query.page_url(0).is_err());
    }

    #[test]
    fn test_listed_taxon_falls_back_to_scientific_name() {
        let taxon: ListedTaxon = serde_json::from_str(r#"{"id": 7, "name": "Anas crecca"}"#).unwrap();
        let entity = taxon.into_entity("https://www.inaturalist.org/");
        assert_eq!(entity.name, "Anas crecca");
        assert_eq!(entity.detail_url, "https://www.inaturalist.org/taxa/7");
    }
}
