use std::path::{Path, PathBuf};

/// Where each collection lives under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage aggregates: orders, families, species inventories, plans.
    pub fn planning(&self) -> PathBuf {
        self.root.join("0_planning")
    }

    /// One raw HarvestRecord per entity.
    pub fn pages(&self) -> PathBuf {
        self.root.join("bronze").join("pages")
    }

    /// One ExtractedRecord per entity.
    pub fn refined(&self) -> PathBuf {
        self.root.join("silver").join("refined")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collections_are_under_root() {
        let layout = DataLayout::new("/tmp/data");
        assert_eq!(layout.planning(), PathBuf::from("/tmp/data/0_planning"));
        assert_eq!(layout.pages(), PathBuf::from("/tmp/data/bronze/pages"));
        assert_eq!(layout.refined(), PathBuf::from("/tmp/data/silver/refined"));
    }
}
