//! The JSON sidecar describing one increment.
//!
//! Each increment `backup_<timestamp>/` carries `backup_<timestamp>.json` with
//! a catalog of every materialized file, summary counts and file lists. The
//! manifest can be regenerated from the increment's `track/` and `deleted/`
//! subtrees when it is missing.

use crate::constants::{DELETED_DIR, INCREMENT_PREFIX, TRACK_DIR};
use crate::context::FileMeta;
use crate::path_util::rel_key;
use crate::state::write_json_atomic;
use crate::{Error, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const MANIFEST_VERSION: &str = "1.0";
/// Maximum number of new/changed paths listed under `files`.
pub const SAMPLE_LIMIT: usize = 100;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Track,
    Deleted,
}

impl Category {
    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Track => TRACK_DIR,
            Category::Deleted => DELETED_DIR,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub size: u64,
    pub mtime: f64,
    #[serde(default)]
    pub mtime_iso: String,
    pub category: Category,
    /// Location inside the increment, e.g. `track/notes/todo.track`.
    pub backup_path: String,
}

impl CatalogEntry {
    pub fn new(category: Category, rel: &str, meta: FileMeta) -> Self {
        Self {
            size: meta.size,
            mtime: meta.mtime,
            mtime_iso: iso_time(meta.mtime),
            category,
            backup_path: format!("{}/{rel}", category.dir_name()),
        }
    }
}

fn iso_time(secs: f64) -> String {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .map(|dt| dt.with_timezone(&Local).to_rfc3339())
        .unwrap_or_default()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub name: String,
    /// `YYYYMMDD_HHMMSS` the increment directory is named after.
    pub timestamp: String,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub new_or_changed_tracked: usize,
    pub deleted_tracked: usize,
    pub total_operations: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<usize>,
    pub deleted: usize,
    pub total_files: usize,
    pub total_size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FileLists {
    /// At most [`SAMPLE_LIMIT`] entries.
    pub new_or_changed: Vec<String>,
    #[serde(default)]
    pub new_or_changed_truncated: bool,
    pub deleted: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub backup_type: String,
    pub backup_info: BackupInfo,
    pub summary: Summary,
    pub statistics: Statistics,
    pub file_catalog: BTreeMap<String, CatalogEntry>,
    pub files: FileLists,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recreated: bool,
}

impl Manifest {
    /// Builds the manifest of an increment from its catalog.
    ///
    /// `new` and `changed` split the tracked entries when the caller knows
    /// the split; a rescan does not.
    pub fn from_catalog(
        name: &str,
        timestamp: &str,
        created_at: DateTime<Local>,
        catalog: BTreeMap<String, CatalogEntry>,
        new: Option<usize>,
        changed: Option<usize>,
    ) -> Self {
        let mut files = FileLists::default();
        let mut tracked = 0;
        for (rel, entry) in &catalog {
            match entry.category {
                Category::Track => {
                    tracked += 1;
                    if files.new_or_changed.len() < SAMPLE_LIMIT {
                        files.new_or_changed.push(rel.clone());
                    } else {
                        files.new_or_changed_truncated = true;
                    }
                }
                Category::Deleted => files.deleted.push(rel.clone()),
            }
        }
        let deleted = files.deleted.len();
        let statistics = Statistics {
            new,
            changed,
            deleted,
            total_files: catalog.len(),
            total_size: catalog.values().map(|e| e.size).sum(),
        };
        Self {
            version: MANIFEST_VERSION.to_string(),
            backup_type: "incremental".to_string(),
            backup_info: BackupInfo {
                name: name.to_string(),
                timestamp: timestamp.to_string(),
                created_at: created_at.to_rfc3339(),
            },
            summary: Summary {
                new_or_changed_tracked: tracked,
                deleted_tracked: deleted,
                total_operations: tracked + deleted,
            },
            statistics,
            file_catalog: catalog,
            files,
            recreated: false,
        }
    }

    /// Writes the manifest into `increment_dir`, replacing any previous one.
    pub fn write(&self, increment_dir: &Path) -> Result<PathBuf> {
        let path = manifest_path(increment_dir)?;
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Reads the manifest of `increment_dir`, `None` if it has none.
    pub fn load(increment_dir: &Path) -> Result<Option<Self>> {
        let path = manifest_path(increment_dir)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

/// `<increment_dir>/<increment name>.json`.
pub fn manifest_path(increment_dir: &Path) -> Result<PathBuf> {
    let name = increment_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Config(format!(
                "'{}' is not a valid increment directory",
                increment_dir.display()
            ))
        })?;
    Ok(increment_dir.join(format!("{name}.json")))
}

/// Rebuilds a manifest by scanning the `track/` and `deleted/` subtrees.
pub fn rescan(increment_dir: &Path) -> Result<Manifest> {
    let mut catalog = BTreeMap::new();
    for category in [Category::Track, Category::Deleted] {
        let base = increment_dir.join(category.dir_name());
        if !base.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&base) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error scanning {}: {e}", base.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = rel_key(entry.path(), &base) else { continue };
            match entry.metadata() {
                Ok(meta) => {
                    let entry = CatalogEntry::new(category, &rel, FileMeta::from_metadata(&meta));
                    catalog.insert(rel, entry);
                }
                Err(e) => warn!("Error processing file {}: {e}", entry.path().display()),
            }
        }
    }

    let name = increment_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let timestamp = name
        .strip_prefix(INCREMENT_PREFIX)
        .unwrap_or(&name)
        .to_string();
    let created_at = fs::metadata(increment_dir)
        .and_then(|m| m.modified())
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());
    let mut manifest = Manifest::from_catalog(&name, &timestamp, created_at, catalog, None, None);
    manifest.recreated = true;
    Ok(manifest)
}

/// Lists the increment directories under the backup `root`, oldest first.
pub fn find_increments(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = vec![];
    let entries = fs::read_dir(root).map_err(|e| Error::io(root, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_increment = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(INCREMENT_PREFIX))
            && path.is_dir()
            && (path.join(TRACK_DIR).is_dir() || path.join(DELETED_DIR).is_dir());
        if is_increment {
            found.push(path);
        }
    }
    // names embed the timestamp, so lexical order is chronological
    found.sort();
    Ok(found)
}

/// Regenerates missing manifests (all of them with `force`) under `root`.
/// Returns how many were written.
pub fn rebuild_manifests(root: &Path, force: bool) -> Result<usize> {
    let increments = find_increments(root)?;
    info!("Found {} increments to inspect", increments.len());
    let mut written = 0;
    for dir in &increments {
        if !force && manifest_path(dir)?.exists() {
            info!("Manifest already exists for {}", dir.display());
            continue;
        }
        match rescan(dir).and_then(|m| m.write(dir)) {
            Ok(path) => {
                info!("Manifest recreated: {}", path.display());
                written += 1;
            }
            Err(e) => warn!("Error recreating manifest for {}: {e}", dir.display()),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(size: u64) -> FileMeta {
        FileMeta {
            size,
            mtime: 1_700_000_000.5,
        }
    }

    #[test]
    fn test_from_catalog_counts_and_caps_sample() {
        let mut catalog = BTreeMap::new();
        for i in 0..(SAMPLE_LIMIT + 5) {
            let rel = format!("t/{i:04}.txt");
            catalog.insert(rel.clone(), CatalogEntry::new(Category::Track, &rel, meta(2)));
        }
        catalog.insert(
            "old.txt".into(),
            CatalogEntry::new(Category::Deleted, "old.txt", meta(10)),
        );

        let manifest = Manifest::from_catalog(
            "backup_20240101_000000",
            "20240101_000000",
            Local::now(),
            catalog,
            Some(SAMPLE_LIMIT + 5),
            Some(0),
        );
        assert_eq!(manifest.summary.new_or_changed_tracked, SAMPLE_LIMIT + 5);
        assert_eq!(manifest.summary.deleted_tracked, 1);
        assert_eq!(manifest.summary.total_operations, SAMPLE_LIMIT + 6);
        assert_eq!(manifest.files.new_or_changed.len(), SAMPLE_LIMIT);
        assert!(manifest.files.new_or_changed_truncated);
        assert_eq!(manifest.files.deleted, vec!["old.txt".to_string()]);
        assert_eq!(manifest.statistics.total_size, 2 * (SAMPLE_LIMIT as u64 + 5) + 10);
        assert_eq!(
            manifest.file_catalog["old.txt"].backup_path,
            "deleted/old.txt"
        );
    }

    #[test]
    fn test_rescan_and_rebuild() {
        let temp = TempDir::new().unwrap();
        let inc = temp.path().join("backup_20240102_030405");
        fs::create_dir_all(inc.join("track/notes")).unwrap();
        fs::create_dir_all(inc.join("deleted")).unwrap();
        fs::write(inc.join("track/notes/todo.track"), b"abc").unwrap();
        fs::write(inc.join("deleted/gone.txt"), b"12345").unwrap();
        fs::create_dir_all(temp.path().join("mirror")).unwrap();

        assert_eq!(rebuild_manifests(temp.path(), false).unwrap(), 1);
        let manifest = Manifest::load(&inc).unwrap().unwrap();
        assert!(manifest.recreated);
        assert_eq!(manifest.backup_info.timestamp, "20240102_030405");
        assert_eq!(manifest.summary.new_or_changed_tracked, 1);
        assert_eq!(manifest.summary.deleted_tracked, 1);
        assert_eq!(manifest.file_catalog["notes/todo.track"].size, 3);
        assert_eq!(manifest.file_catalog["gone.txt"].category, Category::Deleted);
        assert_eq!(manifest.statistics.new, None);

        assert_eq!(rebuild_manifests(temp.path(), false).unwrap(), 0);
        assert_eq!(rebuild_manifests(temp.path(), true).unwrap(), 1);
    }

    #[test]
    fn test_load_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let inc = temp.path().join("backup_20240101_000000");
        fs::create_dir_all(&inc).unwrap();
        assert!(Manifest::load(&inc).unwrap().is_none());
    }

    #[test]
    fn test_iso_time() {
        assert!(iso_time(0.0).starts_with("19"));
        assert!(!iso_time(1_700_000_000.25).is_empty());
    }
}
