use crate::error::{HarvestError, Result};
use crate::model::HarvestRecord;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const ARTIFACT_EXTENSION: &str = "json";

const EMPTY_STEM: &str = "%";

/// File name stem for an id. ASCII letters, digits, `-` and `_` are kept and
/// every other byte becomes `%XX`, so distinct ids never share a file.
pub fn encode_file_stem(id: &str) -> String {
    if id.is_empty() {
        return EMPTY_STEM.to_string();
    }
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

/// Inverse of [`encode_file_stem`]. `None` for stems it could not have made.
pub fn decode_file_stem(stem: &str) -> Option<String> {
    if stem == EMPTY_STEM {
        return Some(String::new());
    }
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Write JSON next to `path` and rename it into place, so readers never see a
/// half-written file.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{:016x}.tmp", file_name, rand::random::<u64>()));

    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };

    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// File-presence checkpoint: an entity is done exactly when `<id>.json`
/// exists in the pages directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open the store, creating its directory. Failing here is fatal for a run.
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

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_file_stem(id), ARTIFACT_EXTENSION))
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.path_for(id).is_file()
    }

    /// Persist a record unless one already exists. Returns whether this call
    /// wrote it. Two workers racing on the same id both write complete files
    /// and one rename wins, so the artifact is never corrupted.
    pub fn commit(&self, record: &HarvestRecord) -> Result<bool> {
        let path = self.path_for(&record.id);
        if path.exists() {
            debug!("Checkpoint for {} already present, not overwriting", record.id);
            return Ok(false);
        }
        write_json_atomic(&path, record, false)?;
        Ok(true)
    }

    pub fn load(&self, id: &str) -> Result<HarvestRecord> {
        Self::load_path(&self.path_for(id))
    }

    pub fn load_path(path: &Path) -> Result<HarvestRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        Self::remove_path(&self.path_for(id))
    }

    pub fn remove_path(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    /// Every committed artifact, sorted by file name. Temp files are ignored.
    pub fn artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_artifact = path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION)
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if is_artifact && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Ids of every committed artifact, decoded from the file names.
    pub fn done_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .artifacts()?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| decode_file_stem(&s.to_string_lossy())))
            .collect())
    }
}
