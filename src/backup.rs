//! Sequences one backup run and owns its failure policy.
//!
//! A run moves through [`Phase`]s in a fixed order. Tracked files are copied
//! into the mirror first so the increment can link them; removed tracked
//! files are linked into the increment before the mirror drops them. Only
//! setup problems abort a run. Everything else is logged, counted in the
//! [`RunReport`] and retried next time because the state is not advanced
//! for it.

use crate::classify::{self, Classification};
use crate::config::Config;
use crate::constants::{MIRROR_DIR, TIMESTAMP_FORMAT};
use crate::context::RunContext;
use crate::diff::{self, ChangeSet};
use crate::increment::IncrementBuilder;
use crate::state::{self, MirrorEntry, MirrorState};
use crate::sync::{MirrorSync, SyncReport};
use crate::{Error, Result};
use chrono::Local;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Classifying,
    Diffing,
    BuildingIncrement,
    SyncingMirror,
    PersistingState,
    Done,
    Reporting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Classifying => "classifying",
            Phase::Diffing => "diffing",
            Phase::BuildingIncrement => "building increment",
            Phase::SyncingMirror => "syncing mirror",
            Phase::PersistingState => "persisting state",
            Phase::Done => "done",
            Phase::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Statistics of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub total_files: usize,
    pub tracked_files: usize,
    pub new_files: usize,
    pub changed_files: usize,
    pub deleted_files: usize,
    pub mirror_copied: usize,
    pub mirror_removed: usize,
    pub vanished: usize,
    /// Soft per-file failures: copies, removals and increment captures.
    pub failures: usize,
    pub increment: Option<PathBuf>,
    /// Whether `mirror.json` was rewritten by this run.
    pub state_saved: bool,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl RunReport {
    fn log(&self) {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        info!("=== BACKUP STATISTICS{mode} ===");
        info!("total_files: {}", self.total_files);
        info!("tracked_files: {}", self.tracked_files);
        info!("new_files: {}", self.new_files);
        info!("changed_files: {}", self.changed_files);
        info!("deleted_files: {}", self.deleted_files);
        info!("mirror_copied: {}", self.mirror_copied);
        info!("mirror_removed: {}", self.mirror_removed);
        info!("vanished: {}", self.vanished);
        info!("failures: {}", self.failures);
        match &self.increment {
            Some(dir) => info!("increment: {}", dir.display()),
            None => info!("increment: none"),
        }
        info!("state_saved: {}", self.state_saved);
        info!("backup_time: {:.2}s", self.elapsed.as_secs_f64());
    }
}

#[derive(Debug)]
pub struct Backup {
    config: Config,
    dry_run: bool,
    phase: Phase,
}

impl Backup {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dry_run: false,
            phase: Phase::Idle,
        }
    }

    /// Logs intended actions instead of performing any mutation.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.config.dist.join(MIRROR_DIR)
    }

    fn enter(&mut self, phase: Phase) {
        info!("Phase: {phase}");
        self.phase = phase;
    }

    /// Classifies the source without touching anything.
    pub fn classify(&self) -> Result<Classification> {
        self.config.validate()?;
        let ctx = RunContext::new(&self.config.src);
        Ok(classify::classify(&ctx, &self.config.rules))
    }

    /// Executes one complete run.
    ///
    /// # Errors
    /// Returns an error only for setup failures: an invalid configuration, or
    /// a backup root, mirror root or increment directory that cannot be
    /// created. `mirror.json` is left untouched in that case.
    pub fn run(&mut self) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport {
            dry_run: self.dry_run,
            ..RunReport::default()
        };
        let mirror_root = self.mirror_root();
        let dist = self.config.dist.clone();
        let src = self.config.src.clone();
        let preserved_dirs = self.config.preserved_dirs.clone();

        self.enter(Phase::Classifying);
        let classification = self.classify()?;
        if classification.is_empty() {
            warn!("No files to backup");
        }
        report.total_files = classification.len();
        report.tracked_files = classification.tracked_count();
        if !self.dry_run {
            fs::create_dir_all(&mirror_root).map_err(|e| Error::io(&mirror_root, e))?;
        }
        let previous = state::load(&dist);

        self.enter(Phase::Diffing);
        let changes = diff::diff(&classification, &previous);
        report.new_files = changes.new_tracked.len();
        report.changed_files = changes.changed_tracked.len();
        report.deleted_files = changes.deleted_tracked.len();
        info!(
            "Changes detected: {} new, {} changed, {} deleted tracked; {} mirror updates, {} mirror removals",
            report.new_files,
            report.changed_files,
            report.deleted_files,
            changes.mirror_updates.len(),
            changes.mirror_removals.len()
        );
        if changes.is_noop() {
            info!("Mirror is up to date");
        }

        self.enter(Phase::BuildingIncrement);
        let sync = MirrorSync {
            source_root: &src,
            mirror_root: &mirror_root,
            preserved_dirs: &preserved_dirs,
            max_workers: self.config.max_workers,
            max_files_per_dir: self.config.max_files_per_dir,
            dry_run: self.dry_run,
        };
        let tracked_copies: BTreeSet<String> = changes
            .tracked_updates()
            .intersection(&changes.mirror_updates)
            .cloned()
            .collect();
        let mut sync_report = sync.copy_sequential(&tracked_copies);

        let snapshot = without_failed_copies(&changes, &sync_report);
        let builder = IncrementBuilder {
            backup_root: &dist,
            mirror_root: &mirror_root,
            dry_run: self.dry_run,
        };
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let built = builder.build(&timestamp, &snapshot)?;
        report.failures += built.failed.len();
        report.increment = built.increment.map(|inc| inc.dir);
        let uncaptured = built.failed;

        self.enter(Phase::SyncingMirror);
        let remaining: BTreeSet<String> = changes
            .mirror_updates
            .difference(&tracked_copies)
            .cloned()
            .collect();
        // the mirror copy is the last one of a deleted file until it is captured
        let removals: BTreeSet<String> = changes
            .mirror_removals
            .difference(&uncaptured)
            .cloned()
            .collect();
        let held = changes.mirror_removals.len() - removals.len();
        if held > 0 {
            warn!("Keeping {held} deleted tracked files in the mirror until they are captured");
        }
        sync_report.merge(sync.apply(&remaining, &removals));
        report.mirror_copied = sync_report.copied;
        report.mirror_removed = sync_report.removed;
        report.vanished = sync_report.vanished.len();
        report.failures += sync_report.failures();

        self.enter(Phase::PersistingState);
        if self.dry_run {
            info!("[dry-run] Would persist mirror state");
        } else {
            let next = next_state(&classification, &previous, &sync_report, &uncaptured);
            if next == previous {
                info!("Mirror state unchanged");
            } else {
                match state::save(&dist, &next) {
                    Ok(()) => report.state_saved = true,
                    Err(e) => error!("Error saving mirror state: {e}"),
                }
            }
        }

        self.enter(Phase::Done);
        report.elapsed = started.elapsed();
        self.enter(Phase::Reporting);
        report.log();
        Ok(report)
    }
}

/// Drops tracked paths whose mirror copy did not land, so a stale or absent
/// mirror file is never snapshotted as their new content.
fn without_failed_copies(changes: &ChangeSet, sync_report: &SyncReport) -> ChangeSet {
    let mut snapshot = changes.clone();
    for rel in sync_report.not_copied() {
        snapshot.new_tracked.remove(rel);
        snapshot.changed_tracked.remove(rel);
    }
    snapshot
}

/// The state to persist: the classification, except that paths whose copy,
/// removal or increment capture failed keep their previous entry (or none).
/// The next run then sees them as changes again and retries.
fn next_state(
    classification: &Classification,
    previous: &MirrorState,
    sync_report: &SyncReport,
    uncaptured: &BTreeSet<String>,
) -> MirrorState {
    let retry: BTreeSet<&String> = sync_report
        .not_copied()
        .chain(&sync_report.failed_removals)
        .chain(uncaptured)
        .collect();
    let mut next = MirrorState::new();
    for (rel, file) in &classification.files {
        if !retry.contains(rel) {
            next.insert(rel.clone(), MirrorEntry::new(file.meta, file.tracked));
        } else if let Some(entry) = previous.get(rel) {
            next.insert(rel.clone(), *entry);
        }
    }
    for rel in retry {
        if classification.files.contains_key(rel) {
            continue;
        }
        if let Some(entry) = previous.get(rel) {
            next.insert(rel.clone(), *entry);
        }
    }
    next
}
