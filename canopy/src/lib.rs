// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{Context, load_config, load_entities, print_banner, resolve_data_dir};
