// Removes pages captured while the upstream was throttling.

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use canopy_scanner::outcome::is_rate_limited_body;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub scanned: usize,
    pub removed: usize,
    pub unreadable: usize,
    /// Throttled pages that could not be deleted.
    pub failed: usize,
}

/// Delete every artifact whose raw content is a throttle page so the next
/// harvest fetches it again. Unreadable files and failed deletions are counted
/// and left alone.
pub fn purge_rate_limited(pages: &CheckpointStore) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();

    for path in pages.artifacts()? {
        report.scanned += 1;

        let record = match CheckpointStore::load_path(&path) {
            Ok(record) => record,
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                report.unreadable += 1;
                continue;
            }
        };

        if is_rate_limited_body(&record.raw_content) {
            match CheckpointStore::remove_path(&path) {
                Ok(()) => {
                    debug!("Removed throttled page {}", path.display());
                    report.removed += 1;
                }
                Err(e) => {
                    warn!("Cannot remove {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        "Purge: {} scanned, {} removed, {} unreadable, {} failed",
        report.scanned, report.removed, report.unreadable, report.failed
    );
    Ok(report)
}
