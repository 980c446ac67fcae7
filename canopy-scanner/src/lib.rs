pub mod browser;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod listing;
pub mod outcome;
pub mod taxon;
pub mod walker;

pub use browser::{BrowserOptions, BrowserTransport, ChromeDriver, DomDriver};
pub use error::ScanError;
pub use fetcher::{FetchMode, Fetcher, HttpTransport, PoliteDelay, RetryPolicy, Target, Transport};
pub use identity::{Identity, IdentityPool};
pub use listing::{Listing, ListingQuery, list_all};
pub use outcome::{FetchOutcome, FetchReport, FetchResult};
pub use taxon::{Entity, FamilyRecord, OrderRecord, TaxonLink};
pub use walker::{HierarchyWalker, Rank, ScrollPolicy, WalkPolicy, scroll_until_stable};
