//! Per-run context passed explicitly to each component.
//!
//! Stat results are memoized for the lifetime of one run only, so a file
//! reached through several rules is stat'ed once and nothing leaks into the
//! next run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Size and modification time of a file, the only inputs of change detection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FileMeta {
    pub size: u64,
    /// Seconds since the Unix epoch, with sub-second precision.
    pub mtime: f64,
}

impl FileMeta {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta.modified().map(system_time_secs).unwrap_or(0.0);
        Self {
            size: meta.len(),
            mtime,
        }
    }
}

/// Converts a `SystemTime` to fractional seconds relative to the Unix epoch.
pub fn system_time_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[derive(Debug)]
pub struct RunContext {
    source_root: PathBuf,
    stats: Mutex<HashMap<PathBuf, Option<FileMeta>>>,
}

impl RunContext {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Stats `path` once per run. Failures are logged and cached as `None`.
    pub fn stat(&self, path: &Path) -> Option<FileMeta> {
        if let Some(cached) = self.lock().get(path) {
            return *cached;
        }
        let meta = match path.metadata() {
            Ok(meta) => Some(FileMeta::from_metadata(&meta)),
            Err(e) => {
                warn!("Error getting metadata for {}: {e}", path.display());
                None
            }
        };
        self.lock().insert(path.to_path_buf(), meta);
        meta
    }

    /// Seeds the cache from metadata already obtained elsewhere (e.g. a walk).
    pub fn remember(&self, path: &Path, meta: &Metadata) -> FileMeta {
        let file_meta = FileMeta::from_metadata(meta);
        self.lock()
            .entry(path.to_path_buf())
            .or_insert(Some(file_meta))
            .unwrap_or(file_meta)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Option<FileMeta>>> {
        // poisoning leaves the map intact
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}
