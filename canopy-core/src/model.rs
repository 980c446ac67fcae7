use canopy_scanner::Entity;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// An entity scheduled on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub entity: Entity,
    pub worker_id: usize,
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(entity: Entity, worker_id: usize) -> Self {
        Self {
            entity,
            worker_id,
            attempts: 0,
        }
    }
}

/// The persisted artifact for one entity. Its presence on disk is what marks
/// the entity as done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub id: String,
    pub url: String,
    #[serde(deserialize_with = "deserialize_scraped_at")]
    pub scraped_at: DateTime<Utc>,
    #[serde(alias = "raw_html_content")]
    pub raw_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<ExtractedRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Epoch(f64),
    Text(DateTime<Utc>),
}

/// Accept RFC 3339 text or fractional epoch seconds. Older page files were
/// stamped with the latter.
fn deserialize_scraped_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Timestamp::deserialize(deserializer)? {
        Timestamp::Text(at) => Ok(at),
        Timestamp::Epoch(secs) => {
            if !secs.is_finite() {
                return Err(D::Error::custom(format!("invalid epoch timestamp {}", secs)));
            }
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
                .ok_or_else(|| D::Error::custom(format!("epoch timestamp out of range: {}", secs)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyRank {
    pub rank: String,
    pub name: String,
}

/// One place/status row of the conservation or establishment tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    pub place: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind {
    Cover,
    Gallery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub kind: PhotoKind,
    pub url: String,
}

/// Normalized view of a detail page. Always re-derivable from the raw
/// content, so it never counts as a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub taxonomy: Vec<TaxonomyRank>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub sounds: Vec<String>,
    #[serde(default)]
    pub conservation: Vec<StatusRow>,
    #[serde(default)]
    pub establishment: Vec<StatusRow>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl ExtractedRecord {
    pub fn rank(&self, rank: &str) -> Option<&str> {
        self.taxonomy
            .iter()
            .find(|r| r.rank == rank)
            .map(|r| r.name.as_str())
    }
}
