use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use crate::parser::{SeedDocument, SeedError};
use crate::validator::{validate, Validation};
use crate::writer::atomic_write;

struct CacheEntry {
    mtime: SystemTime,
    raw: String,
    doc: SeedDocument,
}

/// Shared reader/writer handle for `SEED.md` with an mtime-keyed cache.
///
/// The consolidator owns all writes; everyone else reads snapshots. Any
/// successful persist (or an external restore) bumps the file mtime, which
/// the cache observes on next access.
pub struct SeedStore {
    path: PathBuf,
    cache: Mutex<Option<CacheEntry>>,
}

impl SeedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Raw file content, re-read only when the mtime moved.
    pub fn read_raw(&self) -> Result<String, SeedError> {
        let mtime = std::fs::metadata(&self.path)?.modified()?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = cache.as_ref() {
            if entry.mtime == mtime {
                return Ok(entry.raw.clone());
            }
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let doc = SeedDocument::parse(&raw)?;
        debug!(path = %self.path.display(), "seed re-read from disk");
        *cache = Some(CacheEntry {
            mtime,
            raw: raw.clone(),
            doc,
        });
        Ok(raw)
    }

    /// Parsed document, served from cache while the file is unchanged.
    pub fn read(&self) -> Result<SeedDocument, SeedError> {
        self.read_raw()?;
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .map(|entry| entry.doc.clone())
            .ok_or(SeedError::MissingHeader)
    }

    /// Drop the cache so the next read hits the disk.
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// The single persistence gate: validate, refuse invalid content, then
    /// write atomically and invalidate the cache.
    pub fn persist(&self, content: &str) -> Result<Validation, SeedError> {
        let validation = validate(content);
        if !validation.valid {
            return Err(SeedError::Invalid(validation.errors.join("; ")));
        }
        atomic_write(&self.path, content)?;
        self.invalidate();
        Ok(validation)
    }
}
