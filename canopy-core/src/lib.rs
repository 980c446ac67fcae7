pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod harvest;
pub mod layout;
pub mod model;
pub mod purge;
pub mod refine;
pub mod report;
pub mod stage;
pub mod telemetry;

pub use checkpoint::CheckpointStore;
pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use extract::{ExtractionReport, extract, extract_with_report};
pub use harvest::{
    BrowserSessionFactory, HarvestOptions, HarvestProgressCallback, HttpSessionFactory,
    Orchestrator, SessionFactory,
};
pub use layout::DataLayout;
pub use model::{ExtractedRecord, HarvestRecord, WorkItem};
pub use purge::{PurgeReport, purge_rate_limited};
pub use refine::{RefineReport, refine_all};
pub use stage::StageStore;
pub use telemetry::{Telemetry, TelemetrySnapshot};
