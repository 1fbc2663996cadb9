//! Materializes a timestamped snapshot of tracked changes.
//!
//! New and changed tracked files are linked from the mirror into `track/`,
//! removed tracked files into `deleted/`. The mirror must already hold the new
//! copies and must still hold the removed ones when [`IncrementBuilder::build`]
//! runs. An increment that ends up with no file is deleted again.

use crate::constants::{DELETED_DIR, INCREMENT_PREFIX, TRACK_DIR};
use crate::context::FileMeta;
use crate::diff::ChangeSet;
use crate::file_util;
use crate::manifest::{CatalogEntry, Category, Manifest};
use crate::path_util::join_key;
use crate::{Error, Result};
use chrono::Local;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct Increment {
    pub dir: PathBuf,
    pub name: String,
    pub manifest: Manifest,
    /// False when the manifest could not be written; the files are in place.
    pub manifest_written: bool,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub increment: Option<Increment>,
    /// Paths that could not be captured into the increment.
    pub failed: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct IncrementBuilder<'a> {
    pub backup_root: &'a Path,
    pub mirror_root: &'a Path,
    pub dry_run: bool,
}

impl IncrementBuilder<'_> {
    /// Picks a directory name for `timestamp` that is not taken yet.
    fn reserve_name(&self, timestamp: &str) -> String {
        let base = format!("{INCREMENT_PREFIX}{timestamp}");
        let mut name = base.clone();
        let mut n = 1;
        while self.backup_root.join(&name).exists() {
            name = format!("{base}_{n}");
            n += 1;
        }
        name
    }

    /// Builds the increment for the tracked part of `changes`.
    ///
    /// # Errors
    /// Only failing to create the increment directory is an error. Files that
    /// cannot be captured are reported in [`BuildReport::failed`].
    pub fn build(&self, timestamp: &str, changes: &ChangeSet) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        if !changes.has_tracked_changes() {
            info!("No changes in tracked files, skipping increment creation");
            return Ok(report);
        }
        let name = self.reserve_name(timestamp);
        let dir = self.backup_root.join(&name);
        let updated = changes.tracked_updates();

        if self.dry_run {
            for rel in &updated {
                info!("[dry-run] Would snapshot {rel} into {name}/{TRACK_DIR}");
            }
            for rel in &changes.deleted_tracked {
                info!("[dry-run] Would snapshot {rel} into {name}/{DELETED_DIR}");
            }
            return Ok(report);
        }

        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let hardlink = file_util::can_hardlink(self.mirror_root, &dir);
        if !hardlink {
            warn!("Mirror and increment are on different devices, snapshots will be full copies");
        }

        let mut catalog = BTreeMap::new();
        let mut captured_new = 0;
        let mut captured_changed = 0;
        for rel in &changes.deleted_tracked {
            if let Some(entry) = self.capture(&dir, rel, Category::Deleted, hardlink, &mut report) {
                catalog.insert(rel.clone(), entry);
            }
        }
        for rel in &updated {
            if let Some(entry) = self.capture(&dir, rel, Category::Track, hardlink, &mut report) {
                if changes.new_tracked.contains(rel) {
                    captured_new += 1;
                } else {
                    captured_changed += 1;
                }
                catalog.insert(rel.clone(), entry);
            }
        }

        if catalog.is_empty() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("Removed empty increment directory {}", dir.display()),
                Err(e) => warn!("Can't remove empty increment {}: {e}", dir.display()),
            }
            return Ok(report);
        }

        let manifest = Manifest::from_catalog(
            &name,
            &name[INCREMENT_PREFIX.len()..],
            Local::now(),
            catalog,
            Some(captured_new),
            Some(captured_changed),
        );
        let manifest_written = match manifest.write(&dir) {
            Ok(path) => {
                info!("Backup metadata saved to {}", path.display());
                true
            }
            Err(e) => {
                error!("Error saving metadata for {name}: {e}");
                false
            }
        };
        info!(
            "Created increment {} ({} new or changed, {} deleted)",
            dir.display(),
            manifest.summary.new_or_changed_tracked,
            manifest.summary.deleted_tracked
        );
        report.increment = Some(Increment {
            dir,
            name,
            manifest,
            manifest_written,
        });
        Ok(report)
    }

    fn capture(
        &self,
        dir: &Path,
        rel: &str,
        category: Category,
        hardlink: bool,
        report: &mut BuildReport,
    ) -> Option<CatalogEntry> {
        let src = join_key(self.mirror_root, rel);
        if !src.is_file() {
            warn!("Mirror copy of {rel} is missing, not captured in increment");
            report.failed.insert(rel.to_string());
            return None;
        }
        let dest = join_key(&dir.join(category.dir_name()), rel);
        if let Err(e) = file_util::link_or_copy(&src, &dest, hardlink) {
            error!("Failed to capture {rel} into increment: {e}");
            report.failed.insert(rel.to_string());
            return None;
        }
        debug!("Captured {rel} into {}", category.dir_name());
        match fs::metadata(&dest) {
            Ok(meta) => Some(CatalogEntry::new(category, rel, FileMeta::from_metadata(&meta))),
            Err(e) => {
                error!("Captured {rel} but can't stat it: {e}");
                report.failed.insert(rel.to_string());
                None
            }
        }
    }
}
