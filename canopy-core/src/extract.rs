// Detail page -> ExtractedRecord

use crate::model::{ExtractedRecord, HarvestRecord, Photo, PhotoKind, StatusRow, TaxonomyRank};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

/// Characters kept in the description preview.
const SUMMARY_CHARS: usize = 300;

pub const SECTION_TAXONOMY: &str = "taxonomy";
pub const SECTION_DESCRIPTION: &str = "description";
pub const SECTION_CONSERVATION: &str = "conservation";
pub const SECTION_ESTABLISHMENT: &str = "establishment";
pub const SECTION_COVER: &str = "cover_photo";
pub const SECTION_HEADER: &str = "header";

/// Extraction outcome plus the sections that were absent from the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub record: ExtractedRecord,
    pub missing: Vec<&'static str>,
}

impl ExtractionReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

fn background_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\((?:&quot;|"|')?(.*?)(?:&quot;|"|')?\)"#).expect("static regex")
    })
}

/// URL inside a `background-image: url(...)` declaration.
pub fn background_image_url(style: &str) -> Option<String> {
    background_url_regex()
        .captures(style)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|url| !url.is_empty())
}

/// `https://host/taxa/6930-Anas-platyrhynchos` -> `6930`.
pub fn source_id_from_url(url: &str) -> Option<String> {
    let last = url.trim_end_matches('/').rsplit('/').next()?;
    let id = last.split('-').next()?;
    if id.is_empty() { None } else { Some(id.to_string()) }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: &ElementRef) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

fn extract_taxonomy(document: &Html) -> Option<Vec<TaxonomyRank>> {
    let crumbs_sel = Selector::parse("ul.TaxonCrumbs").unwrap();
    let li_sel = Selector::parse("li").unwrap();
    let rank_sel = Selector::parse("span.rank").unwrap();
    let name_sel = Selector::parse("a.sciname, span.sciname").unwrap();

    let crumbs = document.select(&crumbs_sel).next()?;
    let mut ranks: Vec<TaxonomyRank> = Vec::new();

    for li in crumbs.select(&li_sel) {
        let (Some(rank_el), Some(name_el)) = (li.select(&rank_sel).next(), li.select(&name_sel).next())
        else {
            continue;
        };
        let rank_label = element_text(&rank_el);
        let name = element_text(&name_el).replace(&rank_label, "").trim().to_string();
        let rank = rank_label.to_lowercase();
        if rank.is_empty() || name.is_empty() {
            continue;
        }
        // Nested crumbs repeat ranks; the first occurrence wins.
        if !ranks.iter().any(|r| r.rank == rank) {
            ranks.push(TaxonomyRank { rank, name });
        }
    }

    Some(ranks)
}

fn extract_description(document: &Html) -> Option<String> {
    let desc_sel = Selector::parse("div.wikipedia_description").unwrap();
    let p_sel = Selector::parse("p").unwrap();

    let container = document.select(&desc_sel).next()?;
    let paragraphs: Vec<String> = container
        .select(&p_sel)
        .map(|p| p.text().collect::<String>().trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    Some(paragraphs.join("\n\n"))
}

/// First two cells of every row below `container`; short or blank rows skipped.
fn extract_status_rows(document: &Html, container: &str) -> Option<Vec<StatusRow>> {
    let container_sel = Selector::parse(container).unwrap();
    let tr_sel = Selector::parse("tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();

    let table = document.select(&container_sel).next()?;
    let rows = table
        .select(&tr_sel)
        .filter_map(|row| {
            let cells: Vec<String> = row.select(&td_sel).take(2).map(|td| element_text(&td)).collect();
            match cells.as_slice() {
                [place, status] if !place.is_empty() && !status.is_empty() => Some(StatusRow {
                    place: place.clone(),
                    status: status.clone(),
                }),
                _ => None,
            }
        })
        .collect();

    Some(rows)
}

fn upgrade_thumbnail(url: &str) -> String {
    url.replace("square", "large").replace("small", "large")
}

fn extract_photos(document: &Html) -> (Vec<Photo>, bool) {
    let cover_sel = Selector::parse("div.CoverImage").unwrap();
    let gallery_sel = Selector::parse("ul.others a.photoItem div.CoverImage").unwrap();

    let mut photos = Vec::new();
    let cover = document.select(&cover_sel).next();
    let has_cover = cover.is_some();

    if let Some(url) = cover
        .and_then(|div| div.value().attr("style"))
        .and_then(background_image_url)
    {
        photos.push(Photo {
            kind: PhotoKind::Cover,
            url,
        });
    }

    for div in document.select(&gallery_sel) {
        if let Some(url) = div.value().attr("style").and_then(background_image_url) {
            photos.push(Photo {
                kind: PhotoKind::Gallery,
                url: upgrade_thumbnail(&url),
            });
        }
    }

    (photos, has_cover)
}

fn extract_sounds(document: &Html) -> Vec<String> {
    let audio_sel = Selector::parse("audio").unwrap();
    let source_sel = Selector::parse("source[src]").unwrap();

    document
        .select(&audio_sel)
        .filter_map(|audio| {
            audio
                .value()
                .attr("src")
                .or_else(|| {
                    audio
                        .select(&source_sel)
                        .next()
                        .and_then(|s| s.value().attr("src"))
                })
                .map(str::to_string)
        })
        .collect()
}

fn extract_names(document: &Html) -> Option<(Option<String>, Option<String>)> {
    let header_sel = Selector::parse("#TaxonHeader h1").unwrap();
    let common_sel = Selector::parse("span.comname").unwrap();
    let sci_sel = Selector::parse("span.sciname").unwrap();

    let h1 = document.select(&header_sel).next()?;
    let common = h1.select(&common_sel).next().map(|e| element_text(&e)).and_then(non_empty);
    let scientific = h1.select(&sci_sel).next().map(|e| element_text(&e)).and_then(non_empty);
    Some((common, scientific))
}

fn summarize(description: &str) -> Option<String> {
    if description.is_empty() {
        return None;
    }
    let preview: String = description.chars().take(SUMMARY_CHARS).collect();
    Some(format!("{}...", preview))
}

/// Parse a captured page, recording which sections were absent.
pub fn extract_with_report(raw: &str) -> ExtractionReport {
    let document = Html::parse_document(raw);
    let mut missing = Vec::new();
    let mut record = ExtractedRecord::default();

    match extract_names(&document) {
        Some((common, scientific)) => {
            record.common_name = common;
            record.scientific_name = scientific;
        }
        None => missing.push(SECTION_HEADER),
    }

    match extract_taxonomy(&document) {
        Some(ranks) => record.taxonomy = ranks,
        None => missing.push(SECTION_TAXONOMY),
    }

    match extract_description(&document) {
        Some(text) => {
            record.summary = summarize(&text);
            record.description = text;
        }
        None => missing.push(SECTION_DESCRIPTION),
    }

    match extract_status_rows(&document, "div#status-tab") {
        Some(rows) => record.conservation = rows,
        None => missing.push(SECTION_CONSERVATION),
    }

    match extract_status_rows(&document, "div.establishment-means") {
        Some(rows) => record.establishment = rows,
        None => missing.push(SECTION_ESTABLISHMENT),
    }

    let (photos, has_cover) = extract_photos(&document);
    if !has_cover {
        missing.push(SECTION_COVER);
    }
    record.photos = photos;
    record.sounds = extract_sounds(&document);

    ExtractionReport { record, missing }
}

/// Parse a captured page. Missing sections come back empty.
pub fn extract(raw: &str) -> ExtractedRecord {
    extract_with_report(raw).record
}

/// Extract a stored record, filling in where it came from.
pub fn extract_harvest(record: &HarvestRecord) -> ExtractionReport {
    let mut report = extract_with_report(&record.raw_content);
    report.record.source_id = source_id_from_url(&record.url).or_else(|| Some(record.id.clone()));
    report.record.source_url = Some(record.url.clone());
    report
}
