//! Persistent storage for cell records.
//!
//! A cell record is an `Infoset` shaped as
//! `{id, path, props: {...}, log: [...]}`. Two stores are provided:
//! - `MemoryBackend` for tests and dry runs
//! - `JsonFilesBackend`, one directory per cell under a base directory:
//!   `<base>/<path>/<id>/meta.json` (a `V0` version line followed by the
//!   props JSON) and `<base>/<path>/<id>/log.json`

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::infoset::Infoset;
use crate::unix_timestamp;

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const VERSION_TOKEN: &str = "V0";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("cannot scan cell directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("malformed cell record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("version {0:?} not supported")]
    UnsupportedVersion(String),

    #[error("cell {0:?} not found")]
    NotFound(String),
}

/// Store of cell records keyed by cell id
pub trait CellBackend {
    fn fetch(&self, id: &str) -> Result<Option<Infoset>, BackendError>;

    /// Fresh record for `id` in container `path`; not stored until `put`
    fn create(&self, id: &str, path: &str) -> Result<Infoset, BackendError> {
        Ok(new_record(id, path))
    }

    fn put(&mut self, record: &Infoset) -> Result<(), BackendError>;

    /// Move a stored cell into container `destination`
    fn move_to(&mut self, id: &str, destination: &str) -> Result<(), BackendError>;
}

/// Record of a just created cell
pub fn new_record(id: &str, path: &str) -> Infoset {
    let mut record = Infoset::new();
    record.put(".id", id);
    record.put(".path", normalize_path(path));
    record.put(".props", json!({ "id": id }));
    record.put(
        ".log",
        json!([{ "type": "lifecycle", "event": "entry-created", "ts": unix_timestamp() }]),
    );
    record
}

/// `a/b/`, `/a/b` → `/a/b`; empty → `/`
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn record_id(record: &Infoset) -> Result<&str, BackendError> {
    record
        .fetch_str(".id")
        .ok_or_else(|| BackendError::NotFound("<record without id>".to_string()))
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryBackend {
    cells: BTreeMap<String, Infoset>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl CellBackend for MemoryBackend {
    fn fetch(&self, id: &str) -> Result<Option<Infoset>, BackendError> {
        Ok(self.cells.get(id).cloned())
    }

    fn put(&mut self, record: &Infoset) -> Result<(), BackendError> {
        let id = record_id(record)?.to_string();
        self.cells.insert(id, record.clone());
        Ok(())
    }

    fn move_to(&mut self, id: &str, destination: &str) -> Result<(), BackendError> {
        let record = self
            .cells
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        record.put(".path", normalize_path(destination));
        Ok(())
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// Directory tree of cells, one `meta.json` + `log.json` pair per cell
#[derive(Debug, Clone)]
pub struct JsonFilesBackend {
    base: PathBuf,
}

impl JsonFilesBackend {
    /// Open the tree rooted at `base`, creating the directory if needed
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        let base = base.canonicalize()?;
        debug!(base = %base.display(), "backend setup");
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn cell_dir(&self, path: &str, id: &str) -> PathBuf {
        let relative = path.trim_matches('/');
        let mut dir = self.base.clone();
        if !relative.is_empty() {
            dir.push(relative);
        }
        dir.push(id);
        dir
    }

    /// `meta.json` of the cell with directory name `id`
    fn locate(&self, id: &str) -> Result<Option<PathBuf>, BackendError> {
        for entry in WalkDir::new(&self.base) {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() != META_FILE {
                continue;
            }
            let matches = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .is_some_and(|name| name == id);
            if matches {
                return Ok(Some(entry.into_path()));
            }
        }
        Ok(None)
    }

    fn load(&self, meta: &Path) -> Result<Infoset, BackendError> {
        let cell_dir = meta.parent().unwrap_or(&self.base);
        let id = cell_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut reader = BufReader::new(fs::File::open(meta)?);
        let mut version = String::new();
        reader.read_line(&mut version)?;
        let version = version.trim_end();
        if version != VERSION_TOKEN {
            return Err(BackendError::UnsupportedVersion(version.to_string()));
        }
        let mut props = String::new();
        reader.read_to_string(&mut props)?;
        let props: Value = serde_json::from_str(&props)?;

        // <base>/a/b/<id>/meta.json → /a/b
        let container = cell_dir
            .parent()
            .and_then(|p| p.strip_prefix(&self.base).ok())
            .map(|p| normalize_path(&p.to_string_lossy()))
            .unwrap_or_else(|| "/".to_string());

        let log_path = cell_dir.join(LOG_FILE);
        let log = match fs::read_to_string(&log_path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) => {
                warn!(filename = %log_path.display(), error = %e, "cannot read log");
                json!([])
            }
        };

        let mut record = Infoset::new();
        record.put(".id", id);
        record.put(".path", container);
        record.put(".props", props);
        record.put(".log", log);
        Ok(record)
    }
}

impl CellBackend for JsonFilesBackend {
    fn fetch(&self, id: &str) -> Result<Option<Infoset>, BackendError> {
        info!(id, "searching for cell");
        match self.locate(id)? {
            Some(meta) => self.load(&meta).map(Some),
            None => Ok(None),
        }
    }

    fn put(&mut self, record: &Infoset) -> Result<(), BackendError> {
        let id = record_id(record)?;
        let path = record.fetch_str(".path").unwrap_or("/");
        info!(cell_id = id, path, "storing cell");

        let dir = self.cell_dir(path, id);
        fs::create_dir_all(&dir)?;
        debug!(location = %dir.display(), "cell location");

        let props = record.fetch_or(".props", json!({}));
        fs::write(dir.join(META_FILE), format!("{VERSION_TOKEN}\n{props}"))?;

        let log = record.fetch_or(".log", json!([]));
        fs::write(dir.join(LOG_FILE), log.to_string())?;

        Ok(())
    }

    fn move_to(&mut self, id: &str, destination: &str) -> Result<(), BackendError> {
        let meta = self
            .locate(id)?
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        let from = meta.parent().unwrap_or(&self.base).to_path_buf();
        let to = self.cell_dir(destination, id);
        if from == to {
            return Ok(());
        }

        info!(cell_id = id, destination, "moving cell");
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }
}
