//! Applies copy and removal operations to the mirror tree.
//!
//! Copies are grouped by target directory. A directory receiving more than
//! `max_files_per_dir` files is filled sequentially; the remaining copies run
//! on a pool of at most `max_workers` concurrent tasks. Each task touches only
//! its own destination and results are tallied at the single point where the
//! pool is drained. Removals always run sequentially.

use crate::file_util;
use crate::path_util::{join_key, parent_key};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};

/// Aggregate outcome of a synchronization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: usize,
    /// Sources that disappeared before they could be copied.
    pub vanished: BTreeSet<String>,
    pub failed_copies: BTreeSet<String>,
    pub removed: usize,
    pub failed_removals: BTreeSet<String>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.copied += other.copied;
        self.vanished.extend(other.vanished);
        self.failed_copies.extend(other.failed_copies);
        self.removed += other.removed;
        self.failed_removals.extend(other.failed_removals);
    }

    /// Paths whose mirror copy did not land, for whatever reason.
    pub fn not_copied(&self) -> impl Iterator<Item = &String> {
        self.vanished.iter().chain(self.failed_copies.iter())
    }

    pub fn failures(&self) -> usize {
        self.failed_copies.len() + self.failed_removals.len()
    }

    fn record_copy(&mut self, rel: String, src: &Path, result: io::Result<u64>) {
        match result {
            Ok(_) => {
                debug!("Copied {rel} to mirror");
                self.copied += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !src.exists() => {
                warn!("Source {} vanished before copy, skipping", src.display());
                self.vanished.insert(rel);
            }
            Err(e) => {
                error!("Copy failed {} -> mirror/{rel}: {e}", src.display());
                self.failed_copies.insert(rel);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorSync<'a> {
    pub source_root: &'a Path,
    pub mirror_root: &'a Path,
    pub preserved_dirs: &'a BTreeSet<String>,
    pub max_workers: usize,
    pub max_files_per_dir: usize,
    pub dry_run: bool,
}

impl MirrorSync<'_> {
    fn endpoints(&self, rel: &str) -> (PathBuf, PathBuf) {
        (join_key(self.source_root, rel), join_key(self.mirror_root, rel))
    }

    /// Copies `updates` into the mirror, then removes `removals` from it.
    pub fn apply(&self, updates: &BTreeSet<String>, removals: &BTreeSet<String>) -> SyncReport {
        let mut report = self.copy_all(updates);
        report.merge(self.remove_all(removals));
        info!(
            "Mirror synchronized: {} copied, {} removed, {} vanished, {} failed",
            report.copied,
            report.removed,
            report.vanished.len(),
            report.failures()
        );
        report
    }

    /// Copies `rels` one after another on the calling thread.
    pub fn copy_sequential<'r>(&self, rels: impl IntoIterator<Item = &'r String>) -> SyncReport {
        let mut report = SyncReport::default();
        for rel in rels {
            let (src, dest) = self.endpoints(rel);
            if self.dry_run {
                info!("[dry-run] Would copy {rel} to mirror");
                report.copied += 1;
                continue;
            }
            let result = file_util::copy_preserving(&src, &dest);
            report.record_copy(rel.clone(), &src, result);
        }
        report
    }

    pub fn copy_all(&self, updates: &BTreeSet<String>) -> SyncReport {
        let mut groups: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for rel in updates {
            groups.entry(parent_key(rel)).or_default().push(rel);
        }

        let mut report = SyncReport::default();
        let mut pooled = vec![];
        for (dir, rels) in groups {
            if rels.len() > self.max_files_per_dir {
                debug!("Copying {} files into '{dir}' sequentially", rels.len());
                report.merge(self.copy_sequential(rels));
            } else {
                pooled.extend(rels);
            }
        }
        if self.dry_run || pooled.len() <= 1 || self.max_workers <= 1 {
            report.merge(self.copy_sequential(pooled));
        } else {
            report.merge(self.copy_pooled(pooled));
        }
        report
    }

    fn copy_pooled(&self, rels: Vec<&String>) -> SyncReport {
        let rt = match Builder::new_multi_thread()
            .worker_threads(self.max_workers)
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Unable to start copy workers ({e}), copying sequentially");
                return self.copy_sequential(rels);
            }
        };
        let jobs: Vec<(String, PathBuf, PathBuf)> = rels
            .into_iter()
            .map(|rel| {
                let (src, dest) = self.endpoints(rel);
                (rel.clone(), src, dest)
            })
            .collect();

        rt.block_on(async {
            let mut report = SyncReport::default();
            let mut results = stream::iter(jobs)
                .map(|(rel, src, dest)| async move {
                    let result = file_util::copy_preserving_async(src.clone(), dest).await;
                    (rel, src, result)
                })
                .buffer_unordered(self.max_workers);
            while let Some((rel, src, result)) = results.next().await {
                report.record_copy(rel, &src, result);
            }
            report
        })
    }

    /// Unlinks each mirror file and prunes the directories it leaves empty.
    pub fn remove_all(&self, removals: &BTreeSet<String>) -> SyncReport {
        let mut report = SyncReport::default();
        for rel in removals {
            let path = join_key(self.mirror_root, rel);
            if self.dry_run {
                info!("[dry-run] Would remove {rel} from mirror");
                report.removed += 1;
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed {rel} from mirror");
                    report.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{rel} was already absent from mirror");
                    report.removed += 1;
                }
                Err(e) => {
                    error!("Error removing {} from mirror: {e}", path.display());
                    report.failed_removals.insert(rel.clone());
                    continue;
                }
            }
            self.prune_empty_parents(&path);
        }
        report
    }

    fn prune_empty_parents(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(current) = dir {
            if current == self.mirror_root || !current.starts_with(self.mirror_root) {
                break;
            }
            let preserved = current
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| self.preserved_dirs.contains(n));
            if preserved {
                break;
            }
            // fails on non-empty directories, which ends the walk
            if fs::remove_dir(current).is_err() {
                break;
            }
            debug!("Removed empty directory {}", current.display());
            dir = current.parent();
        }
    }
}
