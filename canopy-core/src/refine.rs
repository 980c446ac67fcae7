use crate::checkpoint::{CheckpointStore, encode_file_stem, write_json_atomic};
use crate::error::{HarvestError, Result};
use crate::extract::extract_harvest;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefineReport {
    pub refined: usize,
    /// Records with sections missing from the page.
    pub partial: usize,
    pub unreadable: usize,
}

/// Re-run extraction over every stored page and write one record per id into
/// `out_dir`. Existing refined records are overwritten.
pub fn refine_all(pages: &CheckpointStore, out_dir: &Path) -> Result<RefineReport> {
    fs::create_dir_all(out_dir).map_err(|source| HarvestError::OutputDir {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let mut report = RefineReport::default();

    for path in pages.artifacts()? {
        let record = match CheckpointStore::load_path(&path) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping unreadable page {}: {}", path.display(), e);
                report.unreadable += 1;
                continue;
            }
        };

        let extraction = extract_harvest(&record);
        if !extraction.is_complete() {
            report.partial += 1;
        }

        let out = out_dir.join(format!("{}.json", encode_file_stem(&record.id)));
        write_json_atomic(&out, &extraction.record, true)?;
        report.refined += 1;
    }

    info!(
        "Refined {} records ({} partial, {} unreadable) into {}",
        report.refined,
        report.partial,
        report.unreadable,
        out_dir.display()
    );
    Ok(report)
}
