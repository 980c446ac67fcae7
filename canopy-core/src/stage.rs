// Aggregate files written once per discovery stage.

use crate::checkpoint::write_json_atomic;
use crate::error::{HarvestError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ORDERS_STAGE: &str = "1_orders";
pub const FAMILIES_STAGE: &str = "2_families";
pub const SPECIES_STAGE: &str = "3_species";

/// Stage name of an API-built scraping plan for a parent taxon.
pub fn plan_stage(parent_id: &str) -> String {
    format!("SCRAPING_PLAN_{}", parent_id)
}

#[derive(Debug, Clone)]
pub struct StageStore {
    dir: PathBuf,
}

impl StageStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| HarvestError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stage))
    }

    pub fn exists(&self, stage: &str) -> bool {
        self.path(stage).is_file()
    }

    pub fn write<T: Serialize + ?Sized>(&self, stage: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(stage);
        write_json_atomic(&path, value, true)?;
        info!("Stage {} saved to {}", stage, path.display());
        Ok(path)
    }

    /// Read a stage by name, or by path when `stage` points at a file.
    pub fn read<T: DeserializeOwned>(&self, stage: &str) -> Result<T> {
        let direct = Path::new(stage);
        let path = if direct.is_file() {
            direct.to_path_buf()
        } else {
            self.path(stage)
        };
        read_json(&path)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| HarvestError::Input {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| HarvestError::Input {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
